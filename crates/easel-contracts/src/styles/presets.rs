use indexmap::IndexMap;

pub const MIDJOURNEY_STYLE_ID: &str = "midjourney-weighted";
pub const CUSTOM_STYLE_ID: &str = "custom";

/// One prompt template. `prompt_structure` carries a `{prompt}` placeholder;
/// the custom preset additionally carries `{customStyle}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StylePreset {
    pub id: String,
    pub name: String,
    pub camera: String,
    pub lighting: String,
    pub aesthetic: String,
    pub prompt_structure: String,
}

/// Ordered preset registry. The first entry doubles as the fallback when a
/// requested style id is unknown.
#[derive(Debug, Clone)]
pub struct StyleRegistry {
    presets: IndexMap<String, StylePreset>,
}

impl StyleRegistry {
    pub fn new(presets: Option<IndexMap<String, StylePreset>>) -> Self {
        Self {
            presets: presets.unwrap_or_else(default_presets),
        }
    }

    pub fn get(&self, id: &str) -> Option<&StylePreset> {
        self.presets.get(id)
    }

    /// Preset for `id`, falling back to the first registered preset.
    pub fn resolve(&self, id: &str) -> &StylePreset {
        self.presets
            .get(id)
            .or_else(|| self.presets.values().next())
            .expect("style registry is never empty")
    }

    pub fn list(&self) -> impl Iterator<Item = &StylePreset> {
        self.presets.values()
    }
}

impl Default for StyleRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Per-style technical phrases appended to the user prompt before template
/// substitution. Unknown styles get the generic phrase.
pub(crate) fn style_enhancement(style_name: &str) -> &'static str {
    match style_name {
        "Cinematic" => {
            "shot with anamorphic lens, dramatic lighting with strong shadows and highlights, \
             film grain texture, color graded with teal and orange tones, shallow depth of field, \
             35mm photography, professional composition"
        }
        "Anime" => {
            "Japanese anime art style, vibrant cel-shaded colors, clean line art, expressive \
             character features, dynamic poses, studio ghibli quality, detailed background art"
        }
        "Oil Painting" => {
            "traditional oil painting on canvas, visible brush strokes, rich color blending, \
             impasto texture, classical painting technique, museum quality, fine art style"
        }
        "Pixel Art" => {
            "16-bit pixel art style, limited color palette, crisp pixels, retro game aesthetic, \
             dithering effects, clean pixel-perfect edges, nostalgic gaming art"
        }
        "Watercolor" => {
            "delicate watercolor painting, soft color washes, paper texture visible, fluid paint \
             bleeds, transparent layers, artistic brush work, hand-painted quality"
        }
        "Photorealistic" => {
            "ultra-realistic photograph, professional DSLR camera, perfect focus and exposure, \
             natural lighting, photographic detail, high-resolution quality, true-to-life rendering"
        }
        _ => "highly detailed, professional quality, expert craftsmanship",
    }
}

fn preset(
    id: &str,
    name: &str,
    camera: &str,
    lighting: &str,
    aesthetic: &str,
    prompt_structure: &str,
) -> (String, StylePreset) {
    (
        id.to_string(),
        StylePreset {
            id: id.to_string(),
            name: name.to_string(),
            camera: camera.to_string(),
            lighting: lighting.to_string(),
            aesthetic: aesthetic.to_string(),
            prompt_structure: prompt_structure.to_string(),
        },
    )
}

fn default_presets() -> IndexMap<String, StylePreset> {
    IndexMap::from([
        preset(
            "no-style",
            "No Style",
            "Auto",
            "Auto",
            "Natural",
            "{prompt}, high quality, detailed, professional, clean image without any text or letters",
        ),
        preset(
            "realistic-photo",
            "Realistic",
            "85mm f/4",
            "3-point 5000K",
            "Natural, documentary",
            "Professional photography of {prompt}, shot with 85mm lens at f/4, natural 3-point \
             lighting at 5000K, documentary style, sharp focus, realistic details, high quality, \
             no text, no letters, no words, clean image",
        ),
        preset(
            "professional-photoshoot",
            "Model Pro",
            "70-200mm f/2.8",
            "Studio beauty dish",
            "Magazine quality",
            "Professional magazine photoshoot of {prompt}, shot with 70-200mm f/2.8, studio \
             beauty dish lighting, editorial quality, fashion photography, bokeh background, \
             high-end production, no text, no letters, clean image",
        ),
        preset(
            "3d-rendering",
            "3D Rendering",
            "50mm f/8",
            "HDRI environment",
            "Clean geometry",
            "3D rendered scene of {prompt}, 50mm focal length f/8, HDRI environment lighting, \
             clean geometric forms, ray-traced, octane render, professional 3D visualization, \
             4K resolution, no text, no letters, clean render",
        ),
        preset(
            "minimalist-illustration",
            "Illustration",
            "50mm f/4",
            "High-key shadow-free",
            "Geometric precision",
            "Minimalist illustration of {prompt}, 50mm perspective f/4, high-key lighting \
             without shadows, geometric precision, clean lines, flat colors, modern design, \
             vector-style aesthetic, no text, no letters, no words",
        ),
        preset(
            "abstract-modern",
            "Abstract Modern",
            "35mm f/5.6",
            "Dynamic colored",
            "Gallery quality",
            "Abstract modern art of {prompt}, 35mm f/5.6, dynamic colored lighting, contemporary \
             gallery aesthetic, artistic composition, bold colors, creative interpretation, fine \
             art quality, no text, no letters, clean artwork",
        ),
        preset(
            "isometric-3d",
            "Isometric 3D",
            "Isometric 30°",
            "Top-down even",
            "Infographic clarity",
            "Isometric 3D illustration of {prompt}, 30-degree isometric angle, top-down even \
             lighting, infographic style, clean and clear, game asset quality, technical \
             illustration, precise geometry, no text, no labels, clean image",
        ),
        preset(
            "claymorphism",
            "Claymorphism",
            "50mm macro",
            "Soft diffused",
            "Playful matte",
            "Claymorphism style of {prompt}, 50mm macro lens, soft diffused lighting, clay \
             material texture, playful matte finish, 3D rendered, pastel colors, rounded shapes, \
             tactile appearance, no text, no letters, clean render",
        ),
        preset(
            "futuristic-neon",
            "Futuristic",
            "35mm f/2.8",
            "Cyberpunk neon",
            "Sci-fi drama",
            "Futuristic cyberpunk scene of {prompt}, 35mm f/2.8, neon lighting, vibrant colors, \
             sci-fi atmosphere, dramatic mood, high contrast, cinematic composition, blade \
             runner aesthetic, no text, no letters, no signs, clean image",
        ),
        preset(
            MIDJOURNEY_STYLE_ID,
            "Midjourney ✨",
            "Variable f/2.8-f/8",
            "Multi-concept weighted",
            "Artifact-free precision",
            "{prompt} ::2 | professional photography ::1.5 | highly detailed ::1.5 | 8K \
             resolution ::1 | sharp focus ::1 | cinematic lighting ::1.5 | no text ::2 | no \
             letters ::2 | no words ::2 | clean image ::2 | artifact-free ::2 --style raw \
             --quality 2",
        ),
        preset(
            CUSTOM_STYLE_ID,
            "Custom Style",
            "User-defined",
            "User-defined",
            "User-defined",
            "{prompt} in {customStyle}, high quality, professional, detailed, no text, no \
             letters, no words, clean image",
        ),
    ])
}
