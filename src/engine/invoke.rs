//! Running bodies on tokio tasks under a timeout.

use super::failure::{Failure, FailureOrigin};
use crate::suite::{Callsite, TestContext, TestFn};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;

pub(crate) type BodyHandle = JoinHandle<anyhow::Result<()>>;

/// What is being invoked; decides the timeout wording and failure origin.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Invocation {
    pub origin: FailureOrigin,
    pub is_hook: bool,
    pub limit: Duration,
    pub callsite: Callsite,
}

/// Spawn `body` and wait for it.
pub(crate) async fn invoke(
    body: &TestFn,
    ctx: TestContext,
    invocation: Invocation,
    background: &mut Vec<BodyHandle>,
) -> Result<(), Failure> {
    let handle = tokio::spawn(body(ctx));
    await_body(handle, invocation, background).await
}

/// Wait for an already spawned body.
///
/// A body that outlives its timeout keeps running; its handle is parked in
/// `background` so teardown can abort it.
pub(crate) async fn await_body(
    mut handle: BodyHandle,
    invocation: Invocation,
    background: &mut Vec<BodyHandle>,
) -> Result<(), Failure> {
    match timeout(invocation.limit, &mut handle).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(err))) => Err(Failure::from_error(
            &err,
            invocation.origin,
            invocation.callsite,
        )),
        Ok(Err(join_err)) if join_err.is_panic() => Err(Failure::from_panic(
            join_err.into_panic(),
            invocation.origin,
            invocation.callsite,
        )),
        Ok(Err(join_err)) => Err(Failure::new(
            format!("body was cancelled before completing: {}", join_err),
            invocation.origin,
        )
        .at(invocation.callsite)),
        Err(_) => {
            tracing::debug!(
                limit_ms = invocation.limit.as_millis() as u64,
                is_hook = invocation.is_hook,
                "body timed out"
            );
            background.push(handle);
            let mut failure =
                Failure::timeout(invocation.limit, invocation.is_hook, invocation.callsite);
            if let FailureOrigin::Hook(_) = invocation.origin {
                failure.origin = invocation.origin;
            }
            Err(failure)
        }
    }
}
