use futures::future;

use crate::{context::RequestContext, DepartError};

/// Removes every file a failed request stored and returns its final error.
///
/// Waits until no file pipeline is in flight, so writes that were already
/// accepted finish before their results are removed. Removal failures are
/// appended to `err`.
pub(crate) async fn roll_back(ctx: &RequestContext, err: DepartError) -> DepartError {
    ctx.pending.zero().await;

    let uploaded = ctx.take_uploaded();
    let Some(storage) = &ctx.config.storage else {
        return err;
    };

    #[cfg(feature = "tracing")]
    tracing::debug!(
        files = uploaded.len(),
        code = err.code(),
        "cleanup: removing stored files"
    );

    let removals = uploaded
        .iter()
        .filter_map(|file| file.storage_result.as_ref())
        .map(|result| storage.remove(result));
    let failures: Vec<DepartError> = future::join_all(removals)
        .await
        .into_iter()
        .flatten()
        .collect();

    #[cfg(feature = "tracing")]
    if !failures.is_empty() {
        tracing::warn!(failed = failures.len(), "cleanup: some files could not be removed");
    }

    err.with_related(failures)
}
