use crate::context::Cancellation;
use crate::error::{OperationKind, SrtError, cancelled_error, timeout_error};
use std::future::Future;
use tokio::time::Instant;

/// 判断截止时间是否已经过期。
pub(crate) fn deadline_expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|deadline| deadline <= Instant::now())
}

/// 在保留取消/超时语义的前提下执行 Future。
///
/// - 进入前先检查截止与取消，已失效时不触碰 `future`；
/// - 取消优先于截止，截止优先于结果（`biased`），确保竞态下返回稳定的错误类别。
pub(crate) async fn run_with_context<F, T>(
    cancellation: &Cancellation,
    deadline: Option<Instant>,
    kind: OperationKind,
    future: F,
) -> Result<T, SrtError>
where
    F: Future<Output = Result<T, SrtError>>,
{
    if cancellation.is_cancelled() {
        return Err(cancelled_error(kind));
    }
    if deadline_expired(deadline) {
        return Err(timeout_error(kind));
    }

    let cancel = cancellation.cancelled();
    tokio::pin!(cancel);
    tokio::pin!(future);

    if let Some(deadline) = deadline {
        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);
        tokio::select! {
            biased;
            _ = &mut cancel => Err(cancelled_error(kind)),
            _ = &mut sleep => Err(timeout_error(kind)),
            result = &mut future => result,
        }
    } else {
        tokio::select! {
            biased;
            _ = &mut cancel => Err(cancelled_error(kind)),
            result = &mut future => result,
        }
    }
}
