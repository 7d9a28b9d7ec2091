//! Static character and body-type tables used to build prompts.
//!
//! Lookups never fail a request: an unknown or missing id collapses to the
//! table's default entry.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacterProfile {
    pub id: &'static str,
    pub appearance: &'static str,
    pub default_outfit: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuscleLevel {
    pub id: &'static str,
    pub phrase: &'static str,
}

pub const CHARACTERS: [CharacterProfile; 9] = [
    CharacterProfile {
        id: "kaori",
        appearance: "a young petite muscular girl with short pink hair and pink eyes, wearing black headphones, small chest",
        default_outfit: "pink crop top and pink shorts",
    },
    CharacterProfile {
        id: "yuka",
        appearance: "a muscular woman with long black hair in a side ponytail with a red scrunchie, red eyes, ahoge",
        default_outfit: "black tank top and black cargo pants",
    },
    CharacterProfile {
        id: "haruka",
        appearance: "a mature muscular woman with orange hair in a messy bun with long side locks, green eyes, bangs",
        default_outfit: "green sundress with low neckline",
    },
    CharacterProfile {
        id: "kasumi",
        appearance: "a mature muscular woman with short red hair and a black eyepatch over her right eye, one yellow eye",
        default_outfit: "unbuttoned black jacket over a red tank top and black pants",
    },
    CharacterProfile {
        id: "manami",
        appearance: "a muscular woman with long wavy light green hair with braided locks tied with red ribbons, light green eyes, medium chest",
        default_outfit: "white seifuku with navy sailor collar and navy pleated skirt",
    },
    CharacterProfile {
        id: "miyu",
        appearance: "a muscular woman with dark purple wavy hair in medium twintails with black bows, purple eyes, medium chest",
        default_outfit: "black sports jacket unzipped over white sports bra and black shorts",
    },
    CharacterProfile {
        id: "naomi",
        appearance: "a mature feral-looking muscular woman with short messy white hair and red eyes, sharp teeth",
        default_outfit: "black tank top and red shorts",
    },
    CharacterProfile {
        id: "saya",
        appearance: "a muscular woman with long straight light blue hair, open light blue eyes, bangs, energetic",
        default_outfit: "white button-up shirt with black choker, plaid skirt, and blue tie",
    },
    CharacterProfile {
        id: "hino",
        appearance: "a muscular woman with long blonde hair, blue eyes, bangs, large chest",
        default_outfit: "seifuku with white shirt, pink ribbon bowtie, pink sailor collar, pink mini skirt",
    },
];

pub const MUSCLE_LEVELS: [MuscleLevel; 4] = [
    MuscleLevel {
        id: "default",
        phrase: "muscular with defined biceps, abs, and strong shoulders",
    },
    MuscleLevel {
        id: "athletic",
        phrase: "athletic",
    },
    MuscleLevel {
        id: "muscular",
        phrase: "muscular with defined biceps, abs, and strong shoulders",
    },
    MuscleLevel {
        id: "highly_muscular",
        phrase: "highly muscular female bodybuilder woman with massive thighs, neck muscles, and powerful build",
    },
];

/// Exact-match lookup. Ids are case-sensitive.
pub fn lookup_character(id: &str) -> Option<&'static CharacterProfile> {
    CHARACTERS.iter().find(|profile| profile.id == id)
}

pub fn lookup_muscle_level(id: &str) -> Option<&'static MuscleLevel> {
    MUSCLE_LEVELS.iter().find(|level| level.id == id)
}

/// `kaori`.
pub fn default_character() -> &'static CharacterProfile {
    &CHARACTERS[0]
}

/// `default`.
pub fn default_muscle_level() -> &'static MuscleLevel {
    &MUSCLE_LEVELS[0]
}

pub fn resolve_character(id: Option<&str>) -> &'static CharacterProfile {
    id.and_then(lookup_character)
        .unwrap_or_else(default_character)
}

pub fn resolve_muscle_level(id: Option<&str>) -> &'static MuscleLevel {
    id.and_then(lookup_muscle_level)
        .unwrap_or_else(default_muscle_level)
}
