//! 请求分类：关键词判定图片生成，其次按是否带附件区分多模态

use crate::error::{Result, ServerError};
use crate::model::{Category, GenerationInput};

/// 表示图片生成意图的短语
const IMAGE_GENERATION_PHRASES: &[&str] = &[
    "generate an image",
    "create an image",
    "draw",
    "paint",
    "illustrate",
    "design a picture",
    "make an image of",
    "visualize",
    "art of",
    "sketch",
];

/// 对提交内容分类；既无文本也无附件时返回校验错误
pub fn classify(input: &GenerationInput) -> Result<Category> {
    if input.is_empty() {
        return Err(ServerError::Validation(
            "either text or a file must be provided".to_string(),
        ));
    }

    if let Some(text) = input.text.as_deref() {
        if requests_image(text) {
            return Ok(Category::ImageGeneration);
        }
    }

    if !input.attachments.is_empty() {
        return Ok(Category::MultiModal);
    }

    Ok(Category::TextOnly)
}

/// 文本中是否出现图片生成短语（整词匹配，忽略大小写）
pub fn requests_image(text: &str) -> bool {
    let lowered = text.to_lowercase();
    IMAGE_GENERATION_PHRASES
        .iter()
        .any(|phrase| contains_whole_phrase(&lowered, phrase))
}

fn contains_whole_phrase(haystack: &str, phrase: &str) -> bool {
    let is_word = |c: char| c.is_alphanumeric() || c == '_';
    haystack.match_indices(phrase).any(|(start, matched)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + matched.len()..].chars().next();
        !before.is_some_and(is_word) && !after.is_some_and(is_word)
    })
}

/// 上传未带 Content-Type 时按扩展名推断
pub fn guess_mime_type(filename: Option<&str>) -> &'static str {
    let ext = filename
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase());
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("pdf") => "application/pdf",
        Some("txt") => "text/plain",
        Some("json") => "application/json",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("mp4") => "video/mp4",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Attachment;

    fn with_file(text: Option<&str>) -> GenerationInput {
        GenerationInput {
            text: text.map(str::to_string),
            attachments: vec![Attachment {
                filename: Some("cat.png".to_string()),
                mime_type: "image/png".to_string(),
                data: vec![1, 2, 3],
            }],
        }
    }

    #[test]
    fn test_image_phrases_win() {
        let input = GenerationInput::text("Please DRAW a cat on a skateboard");
        assert_eq!(classify(&input).unwrap(), Category::ImageGeneration);
        // 带附件时图片意图优先
        assert_eq!(
            classify(&with_file(Some("sketch this"))).unwrap(),
            Category::ImageGeneration
        );
    }

    #[test]
    fn test_whole_word_only() {
        assert!(!requests_image("the drawer is stuck"));
        assert!(!requests_image("a painting of text"));
        assert!(requests_image("could you paint, please?"));
        assert!(requests_image("make an image of the sea"));
    }

    #[test]
    fn test_attachments_are_multi_modal() {
        assert_eq!(classify(&with_file(None)).unwrap(), Category::MultiModal);
        assert_eq!(
            classify(&with_file(Some("what is this?"))).unwrap(),
            Category::MultiModal
        );
    }

    #[test]
    fn test_plain_text_and_empty() {
        assert_eq!(
            classify(&GenerationInput::text("summarise this paragraph")).unwrap(),
            Category::TextOnly
        );
        assert!(matches!(
            classify(&GenerationInput::default()),
            Err(ServerError::Validation(_))
        ));
    }

    #[test]
    fn test_guess_mime_type() {
        assert_eq!(guess_mime_type(Some("photo.JPG")), "image/jpeg");
        assert_eq!(guess_mime_type(Some("noext")), "application/octet-stream");
        assert_eq!(guess_mime_type(None), "application/octet-stream");
    }
}
