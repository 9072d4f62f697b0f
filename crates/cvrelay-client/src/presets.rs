use std::str::FromStr;

/// What a finished task yields; drives default wait timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Image,
    Video,
}

/// The closed set of model presets the client can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Preset {
    T2iV40,
    T2v720,
    T2v1080,
    T2vPro,
    I2vFirst,
    I2vFirstPro,
    I2vFirstTail,
    I2vRecamera,
}

pub const LEGAL_FRAMES: &[u32] = &[121, 241];
pub const LEGAL_ASPECT_RATIOS: &[&str] = &["16:9", "4:3", "1:1", "3:4", "9:16", "21:9"];

const MIB: usize = 1024 * 1024;

/// What a preset accepts and demands, checked before any network call.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub req_key: &'static str,
    pub output: OutputKind,
    pub requires_image: bool,
    pub accepts_image: bool,
    pub min_image_count: usize,
    pub max_image_count: usize,
    pub accepts_frames: bool,
    pub default_frames: Option<u32>,
    pub accepts_aspect_ratio: bool,
    pub default_aspect_ratio: Option<&'static str>,
    pub accepts_template: bool,
    pub template_required: bool,
    pub accepts_camera_strength: bool,
    pub max_single_image_bytes: usize,
    pub max_total_image_bytes: Option<usize>,
}

impl Preset {
    pub fn all() -> &'static [Preset] {
        &[
            Preset::T2iV40,
            Preset::T2v720,
            Preset::T2v1080,
            Preset::T2vPro,
            Preset::I2vFirst,
            Preset::I2vFirstPro,
            Preset::I2vFirstTail,
            Preset::I2vRecamera,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Preset::T2iV40 => "t2i-v40",
            Preset::T2v720 => "t2v-720",
            Preset::T2v1080 => "t2v-1080",
            Preset::T2vPro => "t2v-pro",
            Preset::I2vFirst => "i2v-first",
            Preset::I2vFirstPro => "i2v-first-pro",
            Preset::I2vFirstTail => "i2v-first-tail",
            Preset::I2vRecamera => "i2v-recamera",
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        let video = Capabilities {
            req_key: "",
            output: OutputKind::Video,
            requires_image: false,
            accepts_image: false,
            min_image_count: 0,
            max_image_count: 0,
            accepts_frames: true,
            default_frames: Some(121),
            accepts_aspect_ratio: true,
            default_aspect_ratio: Some("16:9"),
            accepts_template: false,
            template_required: false,
            accepts_camera_strength: false,
            max_single_image_bytes: 5 * MIB,
            max_total_image_bytes: None,
        };

        match self {
            Preset::T2iV40 => Capabilities {
                req_key: "jimeng_t2i_v40",
                output: OutputKind::Image,
                accepts_frames: false,
                default_frames: None,
                accepts_aspect_ratio: false,
                default_aspect_ratio: None,
                ..video
            },
            Preset::T2v720 => Capabilities {
                req_key: "jimeng_ti2v_v30",
                ..video
            },
            Preset::T2v1080 => Capabilities {
                req_key: "jimeng_ti2v_v30_1080p",
                ..video
            },
            Preset::T2vPro => Capabilities {
                req_key: "jimeng_ti2v_v30_pro",
                ..video
            },
            Preset::I2vFirst => Capabilities {
                req_key: "jimeng_i2v_first_v30",
                requires_image: true,
                accepts_image: true,
                min_image_count: 1,
                max_image_count: 1,
                ..video
            },
            Preset::I2vFirstPro => Capabilities {
                req_key: "jimeng_i2v_first_v30_pro",
                requires_image: true,
                accepts_image: true,
                min_image_count: 1,
                max_image_count: 1,
                ..video
            },
            Preset::I2vFirstTail => Capabilities {
                req_key: "jimeng_i2v_first_tail_v30",
                requires_image: true,
                accepts_image: true,
                min_image_count: 2,
                max_image_count: 2,
                max_total_image_bytes: Some(10 * MIB),
                ..video
            },
            Preset::I2vRecamera => Capabilities {
                req_key: "jimeng_i2v_recamera_v10",
                requires_image: true,
                accepts_image: true,
                min_image_count: 1,
                max_image_count: 1,
                accepts_frames: false,
                default_frames: None,
                accepts_template: true,
                template_required: true,
                accepts_camera_strength: true,
                ..video
            },
        }
    }
}

impl FromStr for Preset {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Preset::all()
            .iter()
            .copied()
            .find(|preset| preset.as_str() == raw)
            .ok_or_else(|| format!("unknown preset: {raw}"))
    }
}

impl std::fmt::Display for Preset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
