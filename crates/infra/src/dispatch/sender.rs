use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use teamcloud_commands::{CommandMessage, CommandResult, RuntimeStatus};
use teamcloud_core::{CommandId, OrganizationId};

use crate::retry::RetryPolicy;

use super::transport::{HttpRequest, HttpResponse, HttpTransport};
use super::{DispatchError, ProviderEndpoint, AUTH_CODE_HEADER, CALLBACK_HEADER};

const BAD_REQUEST: u16 = 400;
const UNAUTHORIZED: u16 = 401;
const CONFLICT: u16 = 409;

/// What a single exchange produced after retries.
enum Reply {
    Success(HttpResponse),
    Conflict,
}

/// Pushes commands to providers and fetches their results.
#[derive(Clone)]
pub struct CommandSender {
    transport: Arc<dyn HttpTransport>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for CommandSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandSender")
            .field("retry", &self.retry)
            .finish()
    }
}

impl CommandSender {
    pub fn new(transport: Arc<dyn HttpTransport>, retry: RetryPolicy) -> Self {
        Self { transport, retry }
    }

    /// Post `message` to the provider and interpret the answer.
    ///
    /// A conflict means the provider already knows the command; its current
    /// result is fetched instead.
    pub async fn send(
        &self,
        provider: &ProviderEndpoint,
        message: &CommandMessage,
    ) -> Result<CommandResult, DispatchError> {
        let body = Bytes::from(
            serde_json::to_vec(message).map_err(|e| DispatchError::Decode(e.to_string()))?,
        );
        let url = provider.command_url();
        info!(
            provider_id = %provider.id,
            command_id = %message.command_id,
            command_type = %message.command_type,
            url = %url,
            "sending command to provider"
        );

        let request = HttpRequest::post_json(url, body)
            .header(AUTH_CODE_HEADER, provider.auth_code.as_deref())
            .header(CALLBACK_HEADER, message.callback_url.as_deref());

        match self.exchange(provider, message.command_id, request).await? {
            Reply::Success(response) => decode(
                &response,
                message.command_id,
                message.command.organization_id,
            ),
            Reply::Conflict => {
                info!(
                    provider_id = %provider.id,
                    command_id = %message.command_id,
                    "provider already processing command; fetching its result"
                );
                self.fetch(provider, message.command_id, message.command.organization_id)
                    .await
            }
        }
    }

    /// Current result of a command the provider already accepted.
    pub async fn fetch(
        &self,
        provider: &ProviderEndpoint,
        command_id: CommandId,
        organization_id: OrganizationId,
    ) -> Result<CommandResult, DispatchError> {
        let request = HttpRequest::get(provider.status_url(command_id))
            .header(AUTH_CODE_HEADER, provider.auth_code.as_deref());

        match self.exchange(provider, command_id, request).await? {
            Reply::Success(response) => decode(&response, command_id, organization_id),
            Reply::Conflict => Err(DispatchError::Status {
                provider: provider.id.clone(),
                status: CONFLICT,
                message: "conflict while fetching command result".to_string(),
            }),
        }
    }

    async fn exchange(
        &self,
        provider: &ProviderEndpoint,
        command_id: CommandId,
        request: HttpRequest,
    ) -> Result<Reply, DispatchError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let error = match self.transport.execute(request.clone()).await {
                Ok(response) if response.is_success() => return Ok(Reply::Success(response)),
                Ok(response) if response.status == CONFLICT => return Ok(Reply::Conflict),
                Ok(response) if matches!(response.status, BAD_REQUEST | UNAUTHORIZED) => {
                    warn!(
                        provider_id = %provider.id,
                        command_id = %command_id,
                        status = response.status,
                        "provider rejected command; not retrying"
                    );
                    return Err(DispatchError::Rejected {
                        provider: provider.id.clone(),
                        status: response.status,
                        message: response.snippet(),
                    });
                }
                Ok(response) => DispatchError::Status {
                    provider: provider.id.clone(),
                    status: response.status,
                    message: response.snippet(),
                },
                Err(e) => e,
            };

            if !error.is_retryable() || !self.retry.should_retry(attempt) {
                warn!(
                    provider_id = %provider.id,
                    command_id = %command_id,
                    attempt,
                    error = %error,
                    "giving up on provider"
                );
                return Err(error);
            }

            let delay = self.retry.delay_for_attempt(attempt);
            debug!(
                provider_id = %provider.id,
                command_id = %command_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "provider call failed; retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Parse a provider response. An empty body means the provider accepted the
/// command and will report back later.
fn decode(
    response: &HttpResponse,
    command_id: CommandId,
    organization_id: OrganizationId,
) -> Result<CommandResult, DispatchError> {
    if response.body.iter().all(u8::is_ascii_whitespace) {
        let mut result = CommandResult::for_command(command_id, organization_id);
        result.set_runtime_status(RuntimeStatus::Running);
        return Ok(result);
    }
    let result: CommandResult =
        serde_json::from_slice(&response.body).map_err(|e| DispatchError::Decode(e.to_string()))?;
    if result.command_id != command_id {
        return Err(DispatchError::Decode(format!(
            "result for command {} returned for command {command_id}",
            result.command_id
        )));
    }
    Ok(result)
}
