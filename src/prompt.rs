use crate::catalog::{resolve_character, resolve_muscle_level};

pub const STYLE_ANCHOR: &str =
    "Clean anime linework, vibrant colors, detailed muscle definition, cel-shaded lighting.";

/// Substrings that mean the description already says what the character wears.
const CLOTHING_KEYWORDS: [&str; 27] = [
    "dress", "shirt", "top", "bikini", "swimsuit", "uniform", "jacket", "hoodie", "skirt",
    "pants", "jeans", "bra", "lingerie", "wearing", "bodysuit", "armor", "kimono", "sweater",
    "naked", "nude", "topless", "seifuku", "sundress", "towel", "crop top", "shorts",
    "leggings",
];

/// Plain substring match on the lowercased text, so "stop" and "laptop" count
/// as mentioning "top".
pub fn mentions_clothing(description: &str) -> bool {
    let lowered = description.to_lowercase();
    CLOTHING_KEYWORDS
        .iter()
        .any(|keyword| lowered.contains(keyword))
}

/// Builds the natural-language prompt: appearance and build first, then the
/// scene (with the default outfit unless the scene names clothing), then the
/// fixed style anchor.
pub fn build_prompt(description: &str, character: Option<&str>, muscle_size: Option<&str>) -> String {
    let profile = resolve_character(character);
    let muscle = resolve_muscle_level(muscle_size);

    let subject = format!("anime illustration of {}, {}.", profile.appearance, muscle.phrase);
    let scene = if mentions_clothing(description) {
        format!("{description}.")
    } else {
        format!("Wearing {}, {description}.", profile.default_outfit)
    };

    [subject.as_str(), scene.as_str(), STYLE_ANCHOR].join(" ")
}
