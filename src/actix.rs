//! Actix integration helpers.

use actix_web::{
    dev::Payload,
    error::{ErrorInternalServerError, PayloadError},
    http::{header, StatusCode},
    rt,
    web::{self, Bytes},
    FromRequest, HttpRequest, HttpResponse, ResponseError,
};
use futures::{channel::mpsc, future::LocalBoxFuture, Stream, StreamExt};

use crate::{Depart, DepartError, FormData, ParseError};

/// Actix payload stream converted into a `Send` stream for processing.
pub type ActixBodyStream = mpsc::UnboundedReceiver<Result<Bytes, ParseError>>;

/// Returns the raw `Content-Type` of an Actix request, or an empty string.
pub fn content_type_from_request(request: &HttpRequest) -> &str {
    request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
}

/// Forwards an Actix payload, which is not `Send`, through a channel.
pub fn payload_to_send_stream<S>(payload: S) -> ActixBodyStream
where
    S: Stream<Item = Result<Bytes, PayloadError>> + 'static,
{
    let (tx, rx) = mpsc::unbounded::<Result<Bytes, ParseError>>();
    rt::spawn(async move {
        let mut stream = std::pin::pin!(payload);
        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|err| ParseError::new(format!("actix body stream error: {err}")));
            if tx.unbounded_send(chunk).is_err() {
                break;
            }
        }
    });
    rx
}

impl ResponseError for DepartError {
    fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.kind().status_code().as_u16())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(ResponseError::status_code(self)).body(self.to_string())
    }
}

/// Extractor that processes the request body into [`FormData`].
///
/// Requires a `web::Data<Depart>` in the application data.
#[derive(Debug)]
pub struct DepartForm(pub FormData);

impl FromRequest for DepartForm {
    type Error = actix_web::Error;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, payload: &mut Payload) -> Self::Future {
        let depart = req.app_data::<web::Data<Depart>>().cloned();
        let content_type = content_type_from_request(req).to_owned();
        let body = payload_to_send_stream(payload.take());

        Box::pin(async move {
            let depart = depart
                .ok_or_else(|| ErrorInternalServerError("no Depart processor in app data"))?;
            let form = depart.parse_content_type(&content_type, body).await?;
            Ok(Self(form))
        })
    }
}
