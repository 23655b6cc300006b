use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextContent {
    pub text: String,
}

/// Where the bytes of a file live. Browsers send attachments as `data:` URLs,
/// which are split into media type and base64 payload on the way in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum FileData {
    Url(String),
    Inline(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileContent {
    pub media_type: String,
    pub data: FileData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl FileContent {
    pub fn is_image(&self) -> bool {
        self.media_type.starts_with("image/")
    }

    /// Render the file as a URL, inlining the payload as a `data:` URL when needed
    pub fn to_url(&self) -> String {
        match &self.data {
            FileData::Url(url) => url.clone(),
            FileData::Inline(data) => format!("data:{};base64,{}", self.media_type, data),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
/// User-supplied content: plain text or an attachment
pub enum Content {
    Text(TextContent),
    File(FileContent),
}

impl Content {
    pub fn text<S: Into<String>>(text: S) -> Self {
        Content::Text(TextContent { text: text.into() })
    }

    /// Build file content from a URL. `data:` URLs are decoded into an inline payload,
    /// anything else is kept as a reference.
    pub fn file_from_url<S: Into<String>, T: Into<String>>(url: S, media_type: T) -> Self {
        let url = url.into();
        let data = match url.strip_prefix("data:").and_then(|rest| rest.split_once(',')) {
            Some((_, payload)) => FileData::Inline(payload.to_string()),
            None => FileData::Url(url),
        };
        Content::File(FileContent {
            media_type: media_type.into(),
            data,
            filename: None,
        })
    }

    pub fn inline_file<S: Into<String>, T: Into<String>>(data: S, media_type: T) -> Self {
        Content::File(FileContent {
            media_type: media_type.into(),
            data: FileData::Inline(data.into()),
            filename: None,
        })
    }

    /// Get the text content if this is a TextContent variant
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text(text) => Some(&text.text),
            _ => None,
        }
    }

    /// Get the file content if this is a FileContent variant
    pub fn as_file(&self) -> Option<&FileContent> {
        match self {
            Content::File(file) => Some(file),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_url_is_inlined() {
        let content = Content::file_from_url("data:image/png;base64,aGVsbG8=", "image/png");
        let file = content.as_file().unwrap();
        assert_eq!(file.data, FileData::Inline("aGVsbG8=".to_string()));
        assert_eq!(file.to_url(), "data:image/png;base64,aGVsbG8=");
        assert!(file.is_image());
    }

    #[test]
    fn test_remote_url_is_kept() {
        let content = Content::file_from_url("https://ik.imagekit.io/demo/cat.jpg", "image/jpeg");
        let file = content.as_file().unwrap();
        assert_eq!(
            file.data,
            FileData::Url("https://ik.imagekit.io/demo/cat.jpg".to_string())
        );
    }
}
