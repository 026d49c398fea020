use sha2::{Digest, Sha256};
use thiserror::Error;

pub const ORIGINAL_TEXT_PLACEHOLDER: &str = "original_text";
pub const USER_PROMPT_PLACEHOLDER: &str = "user_prompt";

/// Fallback used when no global rewrite template is configured or it is unusable.
pub const DEFAULT_REWRITE_PROMPT: &str = "Rewrite the following channel post in your own words. \
Keep every fact, number, name and link intact, keep the original language, \
and do not add commentary or a preamble. Return only the rewritten post.\n\n\
Post:\n{original_text}";

/// Fallback for operator-requested improvements when `improve_prompt` is unset or unusable.
pub const DEFAULT_IMPROVE_PROMPT: &str = "Improve the following text as the user instructs.\n\n\
Original text:\n{original_text}\n\n\
User instructions:\n{user_prompt}\n\n\
Requirements:\n\
1. Follow the user's instructions\n\
2. Keep every important fact and number\n\
3. Keep links and mentions if there are any\n\
4. The text must read naturally\n\
5. Use a style that suits a Telegram channel\n\n\
Improved text:";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template references unknown placeholder {{{0}}}")]
    MissingPlaceholder(String),
    #[error("template is malformed at byte {0}")]
    Malformed(usize),
}

/// Substitute `{original_text}` into a rewrite template.
///
/// `{{` and `}}` render as literal braces. Any other placeholder name is an
/// error, as is an unbalanced brace.
pub fn render_rewrite_prompt(template: &str, original_text: &str) -> Result<String, TemplateError> {
    render(template, &[(ORIGINAL_TEXT_PLACEHOLDER, original_text)])
}

/// Substitute `{original_text}` and `{user_prompt}` into an improve template.
pub fn render_improve_prompt(
    template: &str,
    original_text: &str,
    user_prompt: &str,
) -> Result<String, TemplateError> {
    render(
        template,
        &[
            (ORIGINAL_TEXT_PLACEHOLDER, original_text),
            (USER_PROMPT_PLACEHOLDER, user_prompt),
        ],
    )
}

fn render(template: &str, values: &[(&str, &str)]) -> Result<String, TemplateError> {
    let extra = values.iter().map(|(_, v)| v.len()).sum::<usize>();
    let mut out = String::with_capacity(template.len() + extra);
    let mut chars = template.char_indices().peekable();

    while let Some((idx, ch)) = chars.next() {
        match ch {
            '{' => {
                if matches!(chars.peek(), Some((_, '{'))) {
                    chars.next();
                    out.push('{');
                    continue;
                }
                let mut name = String::new();
                let mut closed = false;
                for (_, inner) in chars.by_ref() {
                    match inner {
                        '}' => {
                            closed = true;
                            break;
                        }
                        '{' => return Err(TemplateError::Malformed(idx)),
                        other => name.push(other),
                    }
                }
                if !closed {
                    return Err(TemplateError::Malformed(idx));
                }
                match values.iter().find(|(key, _)| *key == name.trim()) {
                    Some((_, value)) => out.push_str(value),
                    None => return Err(TemplateError::MissingPlaceholder(name)),
                }
            }
            '}' => {
                if matches!(chars.peek(), Some((_, '}'))) {
                    chars.next();
                    out.push('}');
                } else {
                    return Err(TemplateError::Malformed(idx));
                }
            }
            other => out.push(other),
        }
    }

    Ok(out)
}

/// Stable hex digest of a template, used to detect template changes.
pub fn template_digest(template: &str) -> String {
    hex::encode(Sha256::digest(template.as_bytes()))
}
