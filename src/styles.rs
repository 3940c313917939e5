use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Category {
    #[serde(alias = "famous")]
    Famous,
    #[serde(alias = "short")]
    Short,
    #[serde(alias = "long")]
    Long,
    #[serde(alias = "creative")]
    Creative,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct StylePreset {
    pub id: &'static str,
    pub name: &'static str,
    pub category: Category,
    pub prompt: &'static str,
}

const fn preset(id: &'static str, name: &'static str, category: Category, prompt: &'static str) -> StylePreset {
    StylePreset { id, name, category, prompt }
}

pub const PRESETS: &[StylePreset] = &[
    preset("f1", "The Rachel", Category::Famous, "Change the hairstyle to the iconic 90s 'The Rachel' cut. Shoulder-length with heavy, bouncy layers, face-framing highlights, and a voluminous blowout. Maintain the original face and lighting."),
    preset("f2", "The Marilyn", Category::Famous, "Change the hairstyle to a retro 1950s platinum blonde curly bob, styled like Marilyn Monroe. High glamour, soft glossy waves. Keep the face identical."),
    preset("f3", "The Pompadour", Category::Famous, "Change the hairstyle to a classic high-volume Pompadour. Slicked back sides with a tall, rolled top. Rockabilly style with a modern edge. Keep the face identical."),
    preset("f4", "The Farrah", Category::Famous, "Change the hairstyle to 70s feathered layers, massive volume, and flipped-out wings style like Farrah Fawcett. Golden blonde highlights. Keep the face identical."),
    preset("f5", "The Beehive", Category::Famous, "Change the hairstyle to a massive 60s Beehive updo. High volume, elegant, retro styling with a smooth finish. Keep the face identical."),
    preset("f6", "Finger Waves", Category::Famous, "Change the hairstyle to 1920s glossy finger waves. Vintage flapper style, sculpted close to the head with a wet-look finish. Keep the face identical."),
    preset("f7", "The Shag", Category::Famous, "Change the hairstyle to a 70s rock 'n roll shag cut. Choppy layers, bangs, messy texture, and shoulder length. Keep the face identical."),
    preset("s1", "French Bob", Category::Short, "Change the hairstyle to a chic, chin-length French bob with blunt bangs. Glossy texture, Parisian style. Keep the face identical."),
    preset("s2", "Textured Pixie", Category::Short, "Change the hairstyle to a short, textured pixie cut with soft, wispy bangs. Modern, edgy, and layered. Keep the face identical."),
    preset("s3", "Buzz Cut", Category::Short, "Change the hairstyle to a modern military buzz cut. Very short length, uniform fade, clean hairline. Keep the face identical."),
    preset("l1", "Sleek & Straight", Category::Long, "Change the hairstyle to waist-length, liquid-smooth straight hair with a center part. Glass hair trend, high shine. Keep the face identical."),
    preset("l2", "Curtain Bangs", Category::Long, "Change the hairstyle to long wavy layers with trendy curtain bangs framing the face. Soft, romantic, and voluminous. Keep the face identical."),
    preset("l3", "Beach Waves", Category::Long, "Change the hairstyle to long, tousled beach waves with sun-kissed highlights. Salt spray texture, natural look. Keep the face identical."),
    preset("cr1", "The Mullet", Category::Creative, "Change the hairstyle to a modern wolf cut / mullet. Short and choppy on top, long and textured in the back. Edgy fashion style. Keep the face identical."),
    preset("cr2", "Viking Braids", Category::Creative, "Change the hairstyle to intricate, warrior-style Viking braids. Detailed plating, shaved sides, and rugged texture. Keep the face identical."),
    preset("cr3", "Pastel Pink", Category::Creative, "Change the hairstyle to a soft pastel pink wavy bob. Cotton candy color, dreamy aesthetic. Keep the face identical."),
    preset("cr4", "The Afro", Category::Creative, "Change the hairstyle to a large, perfectly round, voluminous natural Afro. Define the tight coils, proud silhouette. Keep the face identical."),
];

pub fn presets(category: Option<Category>) -> Vec<StylePreset> {
    PRESETS
        .iter()
        .filter(|p| category.map_or(true, |c| p.category == c))
        .copied()
        .collect()
}

pub fn find(id: &str) -> Option<&'static StylePreset> {
    PRESETS.iter().find(|p| p.id == id)
}

/// Shown when the trending lookup fails.
pub const FALLBACK_TRENDING: [&str; 5] = [
    "Soft Butterfly Layers",
    "90s Supermodel Blowout",
    "Choppy Shaggy Mullet",
    "Platinum White Pixie",
    "Sleek High Braided Pony",
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_unique() {
        let ids: HashSet<_> = PRESETS.iter().map(|p| p.id).collect();
        assert_eq!(ids.len(), PRESETS.len());
    }

    #[test]
    fn filters_by_category() {
        let short = presets(Some(Category::Short));
        assert_eq!(short.len(), 3);
        assert!(short.iter().all(|p| p.category == Category::Short));
        assert_eq!(presets(None).len(), PRESETS.len());
    }

    #[test]
    fn finds_by_id() {
        assert_eq!(find("cr4").map(|p| p.name), Some("The Afro"));
        assert!(find("nope").is_none());
    }
}
