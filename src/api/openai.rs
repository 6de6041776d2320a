use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tokio_util::sync::CancellationToken;

use crate::api::openai_adapter::{
    final_json, models_json, speech_content_type, to_chat_request, usage_json, InboundChatRequest,
};
use crate::core::entities::SpeechOptions;
use crate::error::GatewayError;
use crate::metrics::REQUESTS_TOTAL;
use crate::providers::{Operation, Provider, ProviderKind, ProviderResponse};
use crate::routing::AppState;
use crate::sse::to_axum_sse;

/// `ANY /api/{provider}/{*path}`
pub async fn proxy(
    State(app): State<AppState>,
    Path((provider, path)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let label = ProviderKind::from_segment(&provider)
        .map(|k| k.name())
        .unwrap_or("unknown");

    let (operation, response) = match app.dispatch(&provider, &path, &headers) {
        Ok((operation, adapter)) => (operation, run(operation, adapter, &body).await),
        Err(e) => {
            tracing::debug!(provider = %provider, path = %path, error = %e, "dispatch rejected");
            REQUESTS_TOTAL
                .with_label_values(&[label, "dispatch", e.kind()])
                .inc();
            return e.into_response();
        }
    };

    let status = match &response {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    };
    REQUESTS_TOTAL
        .with_label_values(&[label, operation.as_str(), status])
        .inc();
    response.unwrap_or_else(IntoResponse::into_response)
}

fn parse_json<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, GatewayError> {
    serde_json::from_slice(body)
        .map_err(|e| GatewayError::Validation(format!("invalid JSON body: {e}")))
}

async fn run(
    operation: Operation,
    adapter: Box<dyn Provider>,
    body: &[u8],
) -> Result<Response, GatewayError> {
    match operation {
        Operation::Chat => {
            let req = to_chat_request(parse_json::<InboundChatRequest>(body)?)?;
            let model = req.config.model.clone();
            // the stream task owns the transport; a client disconnect closes
            // the channel and releases it
            match adapter.invoke(req, CancellationToken::new()).await? {
                ProviderResponse::Streaming(stream) => {
                    Ok(to_axum_sse(model, stream).into_response())
                }
                ProviderResponse::Complete(resp) => {
                    Ok(Json(final_json(&model, &resp)).into_response())
                }
            }
        }
        Operation::Models => Ok(Json(models_json(&adapter.models().await?)).into_response()),
        Operation::Usage => Ok(Json(usage_json(&adapter.usage().await?)).into_response()),
        Operation::Speech => {
            let options: SpeechOptions = parse_json(body)?;
            let content_type = speech_content_type(options.response_format.as_deref());
            let audio = adapter.speech(options).await?;
            Ok((StatusCode::OK, [(header::CONTENT_TYPE, content_type)], audio).into_response())
        }
    }
}
