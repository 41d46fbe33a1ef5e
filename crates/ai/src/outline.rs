//! Slide outline prompting and parsing.

use serde::{Deserialize, Serialize};

use crate::request::{ChatMessage, ChatRequest};
use crate::result::AiError;

pub const MIN_SLIDES: u32 = 3;
pub const MAX_SLIDES: u32 = 20;
const OUTLINE_MAX_TOKENS: u32 = 2000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlideOutline {
    pub title: String,
    pub content: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutlineBrief {
    pub topic: String,
    pub num_slides: u32,
    #[serde(default)]
    pub audience: Option<String>,
    #[serde(default)]
    pub style: Option<String>,
}

impl OutlineBrief {
    pub fn validate(&self) -> Result<(), AiError> {
        let topic_len = self.topic.trim().chars().count();
        if !(5..=200).contains(&topic_len) {
            return Err(AiError::InvalidInput(
                "topic must be between 5 and 200 characters".to_string(),
            ));
        }
        if !(MIN_SLIDES..=MAX_SLIDES).contains(&self.num_slides) {
            return Err(AiError::InvalidInput(format!(
                "num_slides must be between {MIN_SLIDES} and {MAX_SLIDES}"
            )));
        }
        Ok(())
    }

    /// Build the outline request for `model`.
    pub fn to_request(&self, model: &str) -> ChatRequest {
        let mut prompt = format!(
            "Create a presentation outline for the following topic: \"{}\"\n\n\
             Requirements:\n\
             - Generate exactly {} slides (excluding title slide)\n\
             - Each slide should have a clear title and 3-5 bullet points\n\
             - Make it engaging and informative\n",
            self.topic.trim(),
            self.num_slides
        );
        if let Some(audience) = &self.audience {
            prompt.push_str(&format!("- Target audience: {audience}\n"));
        }
        if let Some(style) = &self.style {
            prompt.push_str(&format!("- Presentation style: {style}\n"));
        }
        prompt.push_str(
            "\nFormat your response as JSON with this structure:\n\
             {\"slides\": [{\"title\": \"Slide Title\", \"content\": [\"Bullet point 1\", \"Bullet point 2\"]}]}\n\n\
             Respond ONLY with valid JSON, no additional text.",
        );

        ChatRequest::new(model, vec![ChatMessage::user(prompt)]).with_max_tokens(OUTLINE_MAX_TOKENS)
    }
}

#[derive(Debug, Deserialize)]
struct OutlineBody {
    slides: Vec<SlideOutline>,
}

/// Parse a model reply into at most `num_slides` slides. The JSON may be
/// wrapped in a Markdown code fence.
pub fn parse_outline(content: &str, num_slides: u32) -> Result<Vec<SlideOutline>, AiError> {
    let json = strip_code_fence(content.trim());
    let body: OutlineBody = serde_json::from_str(json)
        .map_err(|e| AiError::decode("outline", format!("invalid outline JSON: {e}")))?;

    let slides: Vec<SlideOutline> = body
        .slides
        .into_iter()
        .filter(|s| !s.title.trim().is_empty())
        .take(num_slides as usize)
        .collect();
    if slides.is_empty() {
        return Err(AiError::decode("outline", "outline contained no slides"));
    }
    Ok(slides)
}

fn strip_code_fence(content: &str) -> &str {
    let inner = if let Some((_, rest)) = content.split_once("```json") {
        rest
    } else if let Some((_, rest)) = content.split_once("```") {
        rest
    } else {
        return content;
    };
    inner.split("```").next().unwrap_or(inner).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn brief() -> OutlineBrief {
        OutlineBrief {
            topic: "Rust for data pipelines".to_string(),
            num_slides: 2,
            audience: Some("engineers".to_string()),
            style: None,
        }
    }

    #[test]
    fn prompt_mentions_slide_count_and_audience() {
        let request = brief().to_request("gpt-3.5-turbo");
        let prompt = &request.messages[0].content;
        assert!(prompt.contains("exactly 2 slides"));
        assert!(prompt.contains("Target audience: engineers"));
        assert_eq!(request.max_tokens, 2000);
    }

    #[test]
    fn fenced_json_is_accepted_and_truncated() {
        let reply = "Here you go:\n```json\n{\"slides\":[\
            {\"title\":\"One\",\"content\":[\"a\"]},\
            {\"title\":\"Two\",\"content\":[\"b\"]},\
            {\"title\":\"Three\",\"content\":[\"c\"]}]}\n```";
        let slides = parse_outline(reply, 2).unwrap();
        assert_eq!(slides.len(), 2);
        assert_eq!(slides[1].title, "Two");
    }

    #[test]
    fn plain_json_is_accepted() {
        let slides = parse_outline(r#"{"slides":[{"title":"Only","content":[]}]}"#, 5).unwrap();
        assert_eq!(slides.len(), 1);
    }

    #[test]
    fn prose_is_a_decode_error() {
        assert!(parse_outline("I cannot help with that.", 3).is_err());
        assert!(parse_outline(r#"{"slides":[]}"#, 3).is_err());
    }

    #[test]
    fn brief_bounds_are_enforced() {
        assert!(brief().validate().is_err());
        let ok = OutlineBrief {
            num_slides: 5,
            ..brief()
        };
        assert!(ok.validate().is_ok());
    }
}
