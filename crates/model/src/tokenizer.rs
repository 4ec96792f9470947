//! Tokenizer wrappers (Qwen 2.5 ChatML, Llama 3.x)

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// Text <-> token id conversion as seen by the decode loop
pub trait TokenCodec {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    fn decode(&self, tokens: &[u32]) -> Result<String>;

    /// Token that ends a turn; natural-stop decoding halts on it
    fn eos_token_id(&self) -> u32;
}

/// Chat format for different model families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatFormat {
    /// Llama 3.x format with <|start_header_id|>, <|end_header_id|>, <|eot_id|>
    Llama3,
    /// ChatML format with <|im_start|>, <|im_end|>
    ChatML,
}

impl ChatFormat {
    /// Render messages and open an assistant turn for generation
    pub fn render(&self, messages: &[ChatMessage]) -> String {
        let mut formatted = String::new();
        match self {
            ChatFormat::Llama3 => {
                for msg in messages {
                    formatted.push_str(&format!(
                        "<|start_header_id|>{}<|end_header_id|>\n\n{}<|eot_id|>",
                        msg.role, msg.content
                    ));
                }
                formatted.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
            }
            ChatFormat::ChatML => {
                for msg in messages {
                    formatted.push_str(&format!(
                        "<|im_start|>{}\n{}<|im_end|>\n",
                        msg.role, msg.content
                    ));
                }
                formatted.push_str("<|im_start|>assistant\n");
            }
        }
        formatted
    }
}

/// Chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role: "system", "user", or "assistant"
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// HuggingFace tokenizer.json wrapper
pub struct Tokenizer {
    inner: tokenizers::Tokenizer,
    /// End of document (`<|endoftext|>` / `<|end_of_text|>`)
    pub end_of_text_token_id: u32,
    /// End of turn (`<|im_end|>` / `<|eot_id|>`); decoding stops on this one
    pub eot_token_id: u32,
    pub chat_format: ChatFormat,
}

impl Tokenizer {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| ModelError::TokenizerError(e.to_string()))?;

        let has_chatml = inner.token_to_id("<|im_start|>").is_some();

        let (end_of_text_token_id, eot_token_id, chat_format) = if has_chatml {
            let eos = inner.token_to_id("<|endoftext|>").unwrap_or(151643);
            let eot = inner.token_to_id("<|im_end|>").unwrap_or(151645);
            (eos, eot, ChatFormat::ChatML)
        } else {
            let eos = inner.token_to_id("<|end_of_text|>").unwrap_or(128001);
            let eot = inner.token_to_id("<|eot_id|>").unwrap_or(128009);
            (eos, eot, ChatFormat::Llama3)
        };

        tracing::info!(
            "Tokenizer loaded from {}: format={:?}, end_of_text={}, eot={}",
            path.display(),
            chat_format,
            end_of_text_token_id,
            eot_token_id
        );

        Ok(Self {
            inner,
            end_of_text_token_id,
            eot_token_id,
            chat_format,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

impl TokenCodec for Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|e| ModelError::TokenizerError(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        self.inner
            .decode(tokens, true)
            .map_err(|e| ModelError::TokenizerError(e.to_string()))
    }

    fn eos_token_id(&self) -> u32 {
        self.eot_token_id
    }
}

/// One token per UTF-8 byte, for runs without a tokenizer.json.
///
/// Ids at or above 256 decode as `<id>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteCodec {
    pub eos_token_id: u32,
}

impl Default for ByteCodec {
    fn default() -> Self {
        Self { eos_token_id: 256 }
    }
}

impl TokenCodec for ByteCodec {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.bytes().map(u32::from).collect())
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        let mut text = String::new();
        let mut bytes = Vec::new();
        for &token in tokens {
            if let Ok(byte) = u8::try_from(token) {
                bytes.push(byte);
                continue;
            }
            text.push_str(&String::from_utf8_lossy(&bytes));
            bytes.clear();
            text.push_str(&format!("<{}>", token));
        }
        text.push_str(&String::from_utf8_lossy(&bytes));
        Ok(text)
    }

    fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_message() {
        let msg = ChatMessage::user("Hello!");
        assert_eq!(msg.role, "user");
        assert_eq!(msg.content, "Hello!");
    }

    #[test]
    fn test_chatml_render() {
        let text = ChatFormat::ChatML.render(&[
            ChatMessage::system("You are a helpful assistant."),
            ChatMessage::user("hi"),
        ]);
        assert_eq!(
            text,
            "<|im_start|>system\nYou are a helpful assistant.<|im_end|>\n\
             <|im_start|>user\nhi<|im_end|>\n<|im_start|>assistant\n"
        );
    }

    #[test]
    fn test_llama3_render_opens_assistant_turn() {
        let text = ChatFormat::Llama3.render(&[ChatMessage::user("hi")]);
        assert!(text.ends_with("<|start_header_id|>assistant<|end_header_id|>\n\n"));
    }

    #[test]
    fn test_codec_stops_on_end_of_turn() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokenizer.json");
        std::fs::write(
            &path,
            r#"{
                "version": "1.0",
                "truncation": null,
                "padding": null,
                "added_tokens": [],
                "normalizer": null,
                "pre_tokenizer": {"type": "Whitespace"},
                "post_processor": null,
                "decoder": null,
                "model": {
                    "type": "WordLevel",
                    "vocab": {"<|im_start|>": 0, "<|im_end|>": 1, "<|endoftext|>": 2, "hi": 3},
                    "unk_token": "<|endoftext|>"
                }
            }"#,
        )
        .unwrap();

        let tokenizer = Tokenizer::from_file(&path).unwrap();
        assert_eq!(tokenizer.chat_format, ChatFormat::ChatML);
        assert_eq!(tokenizer.end_of_text_token_id, 2);
        assert_eq!(tokenizer.eot_token_id, 1);
        assert_eq!(TokenCodec::eos_token_id(&tokenizer), 1);
        assert_eq!(tokenizer.vocab_size(), 4);
    }

    #[test]
    fn test_byte_codec() {
        let codec = ByteCodec::default();
        let ids = codec.encode("héllo").unwrap();
        assert_eq!(ids.len(), 6);
        assert_eq!(codec.decode(&ids).unwrap(), "héllo");
        assert_eq!(codec.decode(&[104, 105, 700, 33]).unwrap(), "hi<700>!");
    }
}
