/// Name fragments of model families that accept image input.
const VISION_MODEL_PATTERNS: &[&str] = &[
    "gpt-4o",
    "gpt-4-turbo",
    "gpt-4-vision",
    "gpt-4.1",
    "gpt-5",
    "o1",
    "o3",
    "o4-mini",
    "claude-3",
    "claude-sonnet-4",
    "claude-opus-4",
    "claude-haiku-4",
    "gemini",
    "gemma3",
    "gemma-3",
    "llava",
    "bakllava",
    "llama3.2-vision",
    "llama-3.2-11b-vision",
    "llama-3.2-90b-vision",
    "llama-4",
    "qwen-vl",
    "qwen2-vl",
    "qwen2.5-vl",
    "qwen2.5vl",
    "pixtral",
    "mistral-small-3",
    "moondream",
    "minicpm-v",
    "cogvlm",
    "internvl",
    "grok-2-vision",
    "grok-vision",
    "vision",
];

/// Whether a model name looks like a multimodal (image-capable) model.
pub fn is_vision_model(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    VISION_MODEL_PATTERNS
        .iter()
        .any(|pattern| name.contains(pattern))
}

/// Keep only vision-capable names, preserving order.
pub fn vision_models<'a, I>(names: I) -> Vec<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    names.into_iter().filter(|n| is_vision_model(n)).collect()
}
