//! Text-to-speech proxy
//!
//! The gateway does not synthesize audio itself; it forwards `{text, voice}`
//! to the configured TTS service and relays the audio bytes.

use crate::config::TtsConfig;
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Serialize)]
struct SynthesisRequest<'a> {
    text: &'a str,
    voice: &'a str,
}

#[derive(Debug, Clone)]
pub struct TtsProxy {
    client: reqwest::Client,
    url: String,
    default_voice: String,
}

impl TtsProxy {
    pub fn from_config(config: &TtsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .context("Failed to build TTS client")?;
        Ok(Self {
            client,
            url: config.url.clone(),
            default_voice: config.default_voice.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Render `text` to audio; an empty voice falls back to the default
    pub async fn synthesize(&self, text: &str, voice: Option<&str>) -> Result<Vec<u8>> {
        if text.trim().is_empty() {
            bail!("No text to synthesize");
        }
        let voice = voice
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(self.default_voice.as_str());

        tracing::debug!(url = %self.url, voice, chars = text.len(), "Forwarding TTS request");
        let response = self
            .client
            .post(&self.url)
            .json(&SynthesisRequest { text, voice })
            .send()
            .await
            .with_context(|| format!("TTS service unreachable at {}", self.url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("TTS service returned {}: {}", status, body.trim());
        }
        let audio = response
            .bytes()
            .await
            .context("Failed to read TTS audio")?;
        Ok(audio.to_vec())
    }
}
