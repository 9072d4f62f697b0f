use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use cvrelay_protocol::{CameraStrength, SubmitTaskRequestBody};

use crate::error::ClientError;
use crate::presets::{LEGAL_ASPECT_RATIOS, LEGAL_FRAMES, Preset};

/// One image input, resolved at build time.
#[derive(Debug, Clone)]
pub enum ImageInput {
    /// Local file, inlined as base64.
    File(PathBuf),
    /// Remote http(s) URL, passed through to the upstream untouched.
    Url(String),
    /// `data:<mime>;base64,<payload>` literal.
    DataUrl(String),
}

/// A typed generation request; validated against the preset's capability
/// record before any network call.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub preset: Preset,
    pub prompt: Option<String>,
    pub images: Vec<ImageInput>,
    pub frames: Option<u32>,
    pub aspect_ratio: Option<String>,
    pub template_id: Option<String>,
    pub camera_strength: Option<CameraStrength>,
    pub seed: Option<i64>,
}

impl GenerationRequest {
    pub fn new(preset: Preset) -> Self {
        Self {
            preset,
            prompt: None,
            images: Vec::new(),
            frames: None,
            aspect_ratio: None,
            template_id: None,
            camera_strength: None,
            seed: None,
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_image(mut self, image: ImageInput) -> Self {
        self.images.push(image);
        self
    }

    pub fn with_frames(mut self, frames: u32) -> Self {
        self.frames = Some(frames);
        self
    }

    pub fn with_aspect_ratio(mut self, aspect_ratio: impl Into<String>) -> Self {
        self.aspect_ratio = Some(aspect_ratio.into());
        self
    }

    pub fn with_template(mut self, template_id: impl Into<String>) -> Self {
        self.template_id = Some(template_id.into());
        self
    }

    pub fn with_camera_strength(mut self, strength: CameraStrength) -> Self {
        self.camera_strength = Some(strength);
        self
    }

    /// Validate against the preset's capabilities and produce the upstream
    /// body, inlining local files and data URLs as base64.
    pub async fn build(&self) -> Result<SubmitTaskRequestBody, ClientError> {
        let caps = self.preset.capabilities();

        if !caps.accepts_image && !self.images.is_empty() {
            return Err(ClientError::Validation(format!(
                "preset {} does not accept image inputs",
                self.preset
            )));
        }
        if self.images.len() < caps.min_image_count || self.images.len() > caps.max_image_count {
            let expected = if caps.min_image_count == caps.max_image_count {
                format!("requires exactly {} images", caps.min_image_count)
            } else {
                format!(
                    "requires between {} and {} images",
                    caps.min_image_count, caps.max_image_count
                )
            };
            return Err(ClientError::Validation(format!(
                "preset {} {expected}, got {}",
                self.preset,
                self.images.len()
            )));
        }

        if let Some(frames) = self.frames {
            if !caps.accepts_frames {
                return Err(ClientError::Validation(format!(
                    "preset {} does not accept a frame count",
                    self.preset
                )));
            }
            if !LEGAL_FRAMES.contains(&frames) {
                return Err(ClientError::Validation(format!(
                    "illegal frame count {frames}; allowed: {LEGAL_FRAMES:?}"
                )));
            }
        }

        if let Some(aspect_ratio) = self.aspect_ratio.as_deref() {
            if !caps.accepts_aspect_ratio {
                return Err(ClientError::Validation(format!(
                    "preset {} does not accept an aspect ratio",
                    self.preset
                )));
            }
            if !LEGAL_ASPECT_RATIOS.contains(&aspect_ratio) {
                return Err(ClientError::Validation(format!(
                    "illegal aspect ratio {aspect_ratio}; allowed: {LEGAL_ASPECT_RATIOS:?}"
                )));
            }
        }

        if caps.template_required && self.template_id.is_none() {
            return Err(ClientError::Validation(format!(
                "preset {} requires a template id",
                self.preset
            )));
        }
        if !caps.accepts_template && self.template_id.is_some() {
            return Err(ClientError::Validation(format!(
                "preset {} does not accept a template id",
                self.preset
            )));
        }
        if !caps.accepts_camera_strength && self.camera_strength.is_some() {
            return Err(ClientError::Validation(format!(
                "camera strength is only valid for the recamera preset, not {}",
                self.preset
            )));
        }

        let mut binary_data_base64 = Vec::new();
        let mut image_urls = Vec::new();
        let mut total_bytes = 0usize;
        for image in &self.images {
            match image {
                ImageInput::File(path) => {
                    let data = tokio::fs::read(path).await.map_err(|err| {
                        ClientError::Validation(format!(
                            "cannot read image {}: {err}",
                            path.display()
                        ))
                    })?;
                    check_image_size(data.len(), caps.max_single_image_bytes)?;
                    total_bytes += data.len();
                    binary_data_base64.push(BASE64.encode(data));
                }
                ImageInput::DataUrl(raw) => {
                    let data = decode_data_url(raw)?;
                    check_image_size(data.len(), caps.max_single_image_bytes)?;
                    total_bytes += data.len();
                    binary_data_base64.push(BASE64.encode(data));
                }
                ImageInput::Url(url) => {
                    if !url.starts_with("http://") && !url.starts_with("https://") {
                        return Err(ClientError::Validation(format!(
                            "image URL must be http(s): {url}"
                        )));
                    }
                    image_urls.push(url.clone());
                }
            }
        }

        if let Some(cap) = caps.max_total_image_bytes {
            if total_bytes > cap {
                return Err(ClientError::Validation(format!(
                    "combined image payload is {total_bytes} bytes, over the {cap} byte ceiling"
                )));
            }
        }

        let frames = match (self.frames, caps.accepts_frames) {
            (Some(frames), _) => Some(frames),
            (None, true) => caps.default_frames,
            (None, false) => None,
        };
        let aspect_ratio = match (&self.aspect_ratio, caps.accepts_aspect_ratio) {
            (Some(ratio), _) => Some(ratio.clone()),
            (None, true) => caps.default_aspect_ratio.map(|s| s.to_string()),
            (None, false) => None,
        };

        Ok(SubmitTaskRequestBody {
            req_key: caps.req_key.to_string(),
            prompt: self.prompt.clone(),
            binary_data_base64,
            image_urls,
            frames,
            aspect_ratio,
            template_id: self.template_id.clone(),
            camera_strength: self.camera_strength,
            seed: self.seed,
        })
    }
}

fn check_image_size(len: usize, cap: usize) -> Result<(), ClientError> {
    if len > cap {
        return Err(ClientError::Validation(format!(
            "image payload is {len} bytes decoded, over the {cap} byte ceiling"
        )));
    }
    Ok(())
}

/// Strict `data:<mime>;base64,<payload>` parsing; anything else is
/// malformed.
fn decode_data_url(raw: &str) -> Result<Vec<u8>, ClientError> {
    let rest = raw
        .strip_prefix("data:")
        .ok_or_else(|| ClientError::Validation("malformed data URL: missing data: prefix".to_string()))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| ClientError::Validation("malformed data URL: missing comma".to_string()))?;
    if !header.ends_with(";base64") {
        return Err(ClientError::Validation(
            "malformed data URL: only base64 payloads are supported".to_string(),
        ));
    }
    let mime = header.trim_end_matches(";base64");
    if mime.is_empty() || !mime.contains('/') {
        return Err(ClientError::Validation(format!(
            "malformed data URL: bad media type {mime:?}"
        )));
    }
    BASE64
        .decode(payload)
        .map_err(|err| ClientError::Validation(format!("malformed data URL payload: {err}")))
}
