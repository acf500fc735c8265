use tracing::info;

use crate::dispatch::queue::RequestQueue;
use crate::error::Result;
use crate::models::provider::GenerationRequest;

const REFINER_SYSTEM_PROMPT: &str = "You correct model output. Reply with the corrected output only, \
with no commentary, so that it satisfies the specification exactly.";

pub fn build_refinement_prompt(
    original_prompt: &str,
    failed_response: &str,
    desired_specification: &str,
) -> String {
    format!(
        "The following prompt produced a response that does not meet the required specification.\n\n\
         ## Original prompt\n{}\n\n\
         ## Response that failed\n{}\n\n\
         ## Required specification\n{}\n\n\
         Produce a new response to the original prompt that conforms to the required specification.",
        original_prompt, failed_response, desired_specification
    )
}

/// Asks for a corrected version of `failed_response` through the normal
/// dispatch path. Single shot: the caller decides whether to try again.
pub async fn refine_prompt(
    queue: &RequestQueue,
    original_prompt: &str,
    failed_response: &str,
    desired_specification: &str,
    provider_name: Option<&str>,
) -> Result<String> {
    let request = GenerationRequest::new(build_refinement_prompt(
        original_prompt,
        failed_response,
        desired_specification,
    ))
    .with_system_prompt(REFINER_SYSTEM_PROMPT)
    .with_label("refine");

    let result = queue.send_request(request, provider_name).await?;
    info!("Refined output received from {}", result.provider);
    Ok(result.text)
}

impl RequestQueue {
    pub async fn refine_prompt(
        &self,
        original_prompt: &str,
        failed_response: &str,
        desired_specification: &str,
    ) -> Result<String> {
        refine_prompt(self, original_prompt, failed_response, desired_specification, None).await
    }
}
