//! Operator-requested improvement of one post's outgoing text.

use anyhow::{bail, Context, Result};
use relay_adapters::TextModel;
use relay_core::{render_improve_prompt, settings_keys, Post, PostId, DEFAULT_IMPROVE_PROMPT};
use relay_storage::Store;
use tracing::{info, info_span, warn, Instrument};

/// Rework the post's outgoing text following `instructions` and store the
/// result as its rewritten text. The original text is kept.
pub async fn improve_post(
    store: &Store,
    model: &dyn TextModel,
    id: PostId,
    instructions: &str,
) -> Result<Post> {
    let instructions = instructions.trim();
    if instructions.is_empty() {
        bail!("improvement instructions are empty");
    }
    let post = store.get_post(id).await?;
    if !post.status.is_pre_publish() {
        bail!("post {id} is {}; only pre-publish posts can be improved", post.status);
    }
    let Some(text) = post.text_for_delivery() else {
        bail!("post {id} has no text to improve");
    };

    let template = store
        .setting_value(settings_keys::IMPROVE_PROMPT)
        .await?
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_IMPROVE_PROMPT.to_string());
    let prompt = match render_improve_prompt(&template, text, instructions) {
        Ok(prompt) => prompt,
        Err(err) => {
            warn!(post_id = id, error = %err, "improve prompt unusable; using default");
            render_improve_prompt(DEFAULT_IMPROVE_PROMPT, text, instructions)?
        }
    };

    let improved = model
        .improve(text, &prompt)
        .instrument(info_span!("improve_post", post_id = id))
        .await
        .with_context(|| format!("improving post {id}"))?;
    let improved = improved.trim();
    if improved.is_empty() {
        bail!("model returned an empty text for post {id}");
    }

    let updated = store.update_post_text(id, Some(improved), None).await?;
    info!(post_id = id, chars = improved.chars().count(), "post text improved");
    Ok(updated)
}
