//! Axum integration helpers.

use std::sync::Arc;

use axum::{
    extract::FromRequest,
    response::{IntoResponse, Response},
};

use crate::{Depart, DepartError, FormData};

/// Rejection returned by [`DepartForm`]; answers with the error's status.
#[derive(Debug)]
pub struct DepartRejection(pub DepartError);

impl IntoResponse for DepartRejection {
    fn into_response(self) -> Response {
        (self.0.status_code(), self.0.to_string()).into_response()
    }
}

impl From<DepartError> for DepartRejection {
    fn from(err: DepartError) -> Self {
        Self(err)
    }
}

/// Axum state types that provide a [`Depart`] processor.
pub trait DepartState {
    /// Returns the processor used for multipart requests.
    fn depart(&self) -> &Depart;
}

impl DepartState for Depart {
    fn depart(&self) -> &Depart {
        self
    }
}

impl DepartState for Arc<Depart> {
    fn depart(&self) -> &Depart {
        self.as_ref()
    }
}

/// Extractor that processes the request body into [`FormData`].
#[derive(Debug)]
pub struct DepartForm(pub FormData);

#[async_trait::async_trait]
impl<AppState> FromRequest<AppState> for DepartForm
where
    AppState: DepartState + Send + Sync,
{
    type Rejection = DepartRejection;

    async fn from_request(
        request: axum::extract::Request,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let (parts, body) = request.into_parts();
        #[cfg(feature = "tracing")]
        tracing::debug!(uri = %parts.uri, "axum: processing multipart request");

        let form = state
            .depart()
            .parse(&parts.headers, body.into_data_stream())
            .await?;
        Ok(Self(form))
    }
}
