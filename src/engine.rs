use std::{fmt::Display, sync::Arc};

use bytes::Bytes;
use futures::{future, Stream};
use tokio::{sync::mpsc, task::JoinSet};

use crate::{
    cleanup,
    config::{DepartConfig, FileDecision},
    context::RequestContext,
    form::{FileId, FormData, UploadedFile},
    part::FileStream,
    storage::{FileMeta, SetupPlan},
    tokenizer::{FieldEvent, FileEvent, Tokenizer, TokenizerEvent, EVENT_CHANNEL_CAPACITY},
    DepartError, ErrorKind,
};

const NON_MULTIPART: &str = "Attempt to process a non-multipart form";

/// Returns `true` for any `multipart/*` content type.
pub(crate) fn is_multipart(content_type: &str) -> bool {
    content_type
        .parse::<mime::Mime>()
        .is_ok_and(|mime| mime.type_() == mime::MULTIPART)
}

/// Processes one request body.
pub(crate) async fn process<S, E>(
    config: Arc<DepartConfig>,
    content_type: &str,
    body: S,
) -> Result<FormData, DepartError>
where
    S: Stream<Item = Result<Bytes, E>> + Send,
    E: Display + Send,
{
    if !is_multipart(content_type) {
        return Err(DepartError::with_details(
            ErrorKind::InvalidFormData,
            NON_MULTIPART,
        ));
    }

    let tokenizer = Tokenizer::new(content_type, config.limits, config.preserve_paths)?;
    let ctx = Arc::new(RequestContext::new(config));
    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let mut pipelines = JoinSet::new();

    future::join(
        tokenizer.run(body, events_tx),
        drive_events(&ctx, events_rx, &mut pipelines),
    )
    .await;

    ctx.pending.zero().await;
    while let Some(joined) = pipelines.join_next().await {
        if let Err(err) = joined {
            ctx.latch(DepartError::internal(format!("file pipeline failed: {err}")));
        }
    }

    match ctx.take_error() {
        Some(err) => Err(cleanup::roll_back(&ctx, err).await),
        None => {
            let form = ctx.seal();
            #[cfg(feature = "tracing")]
            tracing::debug!(
                fields = form.fields().len(),
                files = form.files().len(),
                "engine: request resolved"
            );
            Ok(form)
        }
    }
}

async fn drive_events(
    ctx: &Arc<RequestContext>,
    mut events: mpsc::Receiver<TokenizerEvent>,
    pipelines: &mut JoinSet<()>,
) {
    let mut finished = false;

    while let Some(event) = events.recv().await {
        let outcome = match event {
            // Once an error is latched the body is only drained.
            TokenizerEvent::Field(_) if ctx.is_failed() => Ok(()),
            TokenizerEvent::File(file) if ctx.is_failed() => {
                file.stream.discard();
                Ok(())
            }
            TokenizerEvent::Field(field) => accept_field(ctx, field),
            TokenizerEvent::File(file) => accept_file(ctx, file, pipelines),
            TokenizerEvent::PartsLimit => Err(DepartError::new(ErrorKind::PartCountLimit)),
            TokenizerEvent::FilesLimit => Err(DepartError::new(ErrorKind::FileCountLimit)),
            TokenizerEvent::FieldsLimit => Err(DepartError::new(ErrorKind::FieldCountLimit)),
            TokenizerEvent::Error(err) => Err(err.into()),
            TokenizerEvent::Finish => {
                finished = true;
                Ok(())
            }
        };

        if let Err(err) = outcome {
            ctx.latch(err);
        }
    }

    if !finished && !ctx.is_failed() {
        ctx.latch(DepartError::with_details(
            ErrorKind::InvalidFormData,
            "unexpected end of multipart data",
        ));
    }
}

fn accept_field(ctx: &RequestContext, field: FieldEvent) -> Result<(), DepartError> {
    if field.name_truncated || ctx.config.limits.field_name_too_long(&field.name) {
        return Err(DepartError::new(ErrorKind::FieldKeyLimit));
    }
    if field.value_truncated {
        return Err(DepartError::with_details(
            ErrorKind::FieldValueLimit,
            field.name,
        ));
    }

    ctx.with_form(|form| form.add_field(&field.name, field.value));
    Ok(())
}

fn accept_file(
    ctx: &Arc<RequestContext>,
    file: FileEvent,
    pipelines: &mut JoinSet<()>,
) -> Result<(), DepartError> {
    let FileEvent { meta, stream } = file;

    if meta.original_name.is_empty() {
        stream.discard();
        return Ok(());
    }
    if ctx.config.limits.field_name_too_long(&meta.field_name) {
        return Err(DepartError::new(ErrorKind::FieldKeyLimit));
    }

    let id = ctx.with_form(|form| {
        ctx.config
            .file_fields
            .check(&meta.field_name, &meta.original_name, form)?;
        Ok::<_, DepartError>(form.add_file(UploadedFile::new(meta.clone())))
    })?;

    #[cfg(feature = "tracing")]
    tracing::debug!(
        field_name = meta.field_name.as_str(),
        original_name = meta.original_name.as_str(),
        "engine: file accepted"
    );

    let guard = ctx.pending.track();
    let ctx = Arc::clone(ctx);
    pipelines.spawn(async move {
        let _guard = guard;
        run_pipeline(&ctx, id, meta, stream).await;
    });
    Ok(())
}

async fn run_pipeline(ctx: &RequestContext, id: FileId, meta: FileMeta, stream: FileStream) {
    if let Err(err) = store_file(ctx, id, &meta, stream).await {
        let mut err = err;
        if let Err(missing) = ctx.with_form(|form| form.remove_file(id)) {
            err.fold(missing);
        }
        ctx.latch(err);
    }
}

async fn store_file(
    ctx: &RequestContext,
    id: FileId,
    meta: &FileMeta,
    stream: FileStream,
) -> Result<(), DepartError> {
    let plan = match &ctx.config.on_file {
        Some(hook) => match hook(ctx.file(id)?).await? {
            FileDecision::Skip => {
                stream.discard();
                ctx.with_form(|form| form.remove_file(id))?;
                return Ok(());
            }
            FileDecision::Accept(plan) => Some(plan),
        },
        None => None,
    };

    let Some(storage) = &ctx.config.storage else {
        stream.discard();
        return ctx.with_form(|form| form.attach_storage(id, plan, None));
    };

    let monitor = stream.monitor();
    let result = storage
        .dispatch(Box::pin(stream), meta, plan.as_ref().unwrap_or(&SetupPlan::Default))
        .await?;
    ctx.with_form(|form| form.attach_storage(id, plan, Some(result)))?;
    let stored = ctx.file(id)?;

    if monitor.truncated() {
        ctx.push_uploaded(stored);
        return Err(DepartError::with_details(
            ErrorKind::FileSizeLimit,
            meta.field_name.clone(),
        ));
    }

    if let Some(hook) = &ctx.config.on_file_stored {
        if let Err(err) = hook(stored.clone()).await {
            ctx.push_uploaded(stored);
            return Err(err);
        }
    }

    ctx.push_uploaded(stored);
    Ok(())
}
