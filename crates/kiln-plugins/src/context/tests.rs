//! Unit tests for call contexts.

use std::thread;
use std::time::Duration;

use super::*;
use crate::error::PluginErrorKind;

#[test]
fn fresh_context_passes_check() {
    let ctx = CallContext::with_timeout(Duration::from_secs(5));
    assert!(ctx.check("p", TimedOperation::Call).is_ok());
    assert!(ctx.remaining() > Duration::ZERO);
}

#[test]
fn expired_context_reports_timeout() {
    let ctx = CallContext::with_timeout(Duration::from_millis(1));
    thread::sleep(Duration::from_millis(10));
    assert!(ctx.is_expired());
    assert_eq!(ctx.remaining(), Duration::ZERO);
    let error = ctx.check("p", TimedOperation::Call).expect_err("expired");
    assert_eq!(error.kind(), PluginErrorKind::Timeout);
}

#[test]
fn cancellation_wins_over_expiry() {
    let token = CancellationToken::new();
    let ctx = CallContext::with_timeout(Duration::ZERO).with_cancellation(token.clone());
    token.cancel();
    let error = ctx.check("p", TimedOperation::Call).expect_err("cancelled");
    assert_eq!(error.kind(), PluginErrorKind::Cancelled);
}

#[test]
fn cancellation_is_visible_across_threads() {
    let token = CancellationToken::new();
    let ctx = CallContext::with_timeout(Duration::from_secs(5)).with_cancellation(token.clone());
    thread::spawn(move || token.cancel())
        .join()
        .expect("cancel thread");
    assert!(ctx.is_cancelled());
}
