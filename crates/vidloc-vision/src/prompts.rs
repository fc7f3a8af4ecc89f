//! Prompt templates for perception and generation

use vidloc_core::{PersonRecord, Persona, TransformationTheme};

/// Instruction for the text removal edit
pub const TEXT_REMOVAL_PROMPT: &str = "remove all text and captions from image, keep everything else intact";

/// Angle variants rendered from the first portrait of an identity
pub const PORTRAIT_VARIANTS: [&str; 4] = [
    "three-quarter view turned to the left",
    "three-quarter view turned to the right",
    "side profile view",
    "frontal view with a gentle natural smile",
];

/// Person detection prompt for a single image
pub fn build_detection_prompt() -> String {
    r#"You are a casting assistant cataloguing the people visible in a video frame.

## Task
Find every person visible in the image, including partially visible people and people in the background.
Ignore people shown on screens, posters or packaging.

## Output Format
Return a JSON object with a "people" array. Each item should have:
- "bbox": [x_min, y_min, x_max, y_max] normalized to 0.0-1.0 of the image width and height
- "gender": apparent gender, e.g. "woman", "man"
- "age": apparent age bracket, e.g. "20s", "40s", "child"
- "skin": skin tone, e.g. "light", "medium", "dark"
- "hair": hair color and style, e.g. "shoulder-length brown hair"
- "clothing": visible clothing with colors, e.g. "white t-shirt and blue jeans"

Example output:
```json
{
  "people": [
    {
      "bbox": [0.12, 0.20, 0.48, 0.98],
      "gender": "woman",
      "age": "30s",
      "skin": "light",
      "hair": "long blonde hair",
      "clothing": "green knit sweater"
    }
  ]
}
```

If nobody is visible return {"people": []}.
Return ONLY the JSON object, no other text."#
        .to_string()
}

/// Persona design prompt: one replacement per original person
pub fn build_persona_prompt(originals: &[PersonRecord], theme: &TransformationTheme) -> String {
    let originals_str = originals
        .iter()
        .enumerate()
        .map(|(i, p)| {
            format!(
                "{}. {} ({}), wearing {}, seen {}",
                i + 1,
                p.person_id,
                p.appearance.description(),
                if p.appearance.clothing.is_empty() {
                    "unspecified clothing"
                } else {
                    p.appearance.clothing.as_str()
                },
                p.position
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"You are a casting director localizing a video advertisement for a new audience.

## Task
Design one replacement person for each original person below so the video fits the target audience.
Keep the role each person plays in the scene. Keep their clothing style unless the audience calls for a change.

## Target Audience
{theme}

## Original People
{originals_str}

## Output Format
Return a JSON object with a "people" array containing exactly {count} items, in the same order as the original people. Each item should have:
- "gender": gender of the replacement
- "age": age bracket of the replacement
- "skin": skin tone of the replacement
- "hair": hair color and style
- "clothing": clothing to wear
- "casting_notes": face shape, build and expression in one sentence

Return ONLY the JSON object, no other text."#,
        theme = theme,
        originals_str = originals_str,
        count = originals.len(),
    )
}

/// Casting description used for every portrait and frame edit of a persona
pub fn casting_description(persona: &Persona) -> String {
    let mut description = persona.appearance.description();
    if !persona.appearance.clothing.is_empty() {
        description.push_str(&format!(", wearing {}", persona.appearance.clothing));
    }
    if !persona.casting_notes.is_empty() {
        description.push_str(&format!(". {}", persona.casting_notes));
    }
    description
}

/// First, frontal reference portrait of a persona
pub fn build_portrait_prompt(casting: &str, original_clothing: &str) -> String {
    let clothing_line = if original_clothing.is_empty() {
        String::new()
    } else {
        format!("\nMatch the silhouette of this original outfit: {}.", original_clothing)
    };

    format!(
        r#"Full-body studio reference photo of a single person: {casting}.
Frontal view, standing upright, neutral expression, arms relaxed.
Plain light grey background, soft even lighting, sharp focus on the face.{clothing_line}
Photorealistic, no text, no watermark."#,
        casting = casting,
        clothing_line = clothing_line,
    )
}

/// Angle variant of an existing portrait
pub fn build_portrait_variant_prompt(variant: &str) -> String {
    format!(
        r#"Show the exact same person from this reference photo in a {variant}.
Keep the face, skin tone, hair, body shape and clothing identical.
Keep the plain light grey background and soft even lighting.
Photorealistic, no text, no watermark."#,
        variant = variant,
    )
}

/// One person to replace in a frame edit
#[derive(Debug, Clone)]
pub struct EditSubject<'a> {
    /// Where the person stands, e.g. "left third of the frame"
    pub position: &'a str,
    /// Description of the person currently in the frame
    pub original: &'a str,
    /// Casting description of the replacement
    pub replacement: &'a str,
    /// 1-based image number of the first reference portrait
    pub first_reference: usize,
    /// Number of reference portraits
    pub reference_count: usize,
}

/// Frame edit instruction; image 1 is the frame, references follow
pub fn build_frame_edit_prompt(subjects: &[EditSubject<'_>]) -> String {
    let subjects_str = subjects
        .iter()
        .map(|s| {
            let references = if s.reference_count <= 1 {
                format!("image {}", s.first_reference)
            } else {
                format!(
                    "images {}-{}",
                    s.first_reference,
                    s.first_reference + s.reference_count - 1
                )
            };
            format!(
                "- Replace the {} in the {} with the person shown in {} ({}).",
                s.original, s.position, references, s.replacement
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"Image 1 is a frame from a video. The other images are reference portraits.

## Task
{subjects_str}

## Keep Unchanged
- Pose, body orientation and limb positions of every person
- Lighting, color grading and camera framing
- Background layout and every object outside the people
- Anything outside the replaced people's regions

The replacement face, skin tone, hair and clothing must match the reference portraits exactly.
Return the edited frame only, at the same size as image 1."#,
        subjects_str = subjects_str,
    )
}

/// Motion prompt for first/last frame video generation
pub fn build_motion_prompt(casting: &[String], duration_secs: f64) -> String {
    let people = if casting.is_empty() {
        "the scene".to_string()
    } else {
        casting.join("; ")
    };

    format!(
        r#"Smooth, natural motion over {duration:.1} seconds that starts exactly on the first frame and ends exactly on the last frame.
People: {people}.
Keep every person's face, hair and clothing consistent throughout. Keep the camera and background stable.
No text, no captions, no added people."#,
        duration = duration_secs,
        people = people,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use vidloc_core::Appearance;

    fn create_test_persona() -> Persona {
        Persona {
            appearance: Appearance {
                gender: "man".to_string(),
                age: "40s".to_string(),
                skin: "dark".to_string(),
                hair: "short curly black hair".to_string(),
                clothing: "navy blazer".to_string(),
            },
            casting_notes: "Broad smile, athletic build".to_string(),
        }
    }

    #[test]
    fn test_casting_description() {
        assert_eq!(
            casting_description(&create_test_persona()),
            "40s man with dark skin tone with short curly black hair, wearing navy blazer. Broad smile, athletic build"
        );
    }

    #[test]
    fn test_persona_prompt_lists_originals_and_count() {
        let originals = vec![
            PersonRecord {
                person_id: "person_001".to_string(),
                appearance: Appearance {
                    gender: "woman".to_string(),
                    clothing: "red coat".to_string(),
                    ..Default::default()
                },
                description: "woman".to_string(),
                position: "left third of the frame".to_string(),
                sightings: vec![],
            },
            PersonRecord {
                person_id: "person_002".to_string(),
                appearance: Appearance::default(),
                description: "person".to_string(),
                position: "center of the frame".to_string(),
                sightings: vec![],
            },
        ];
        let prompt = build_persona_prompt(&originals, &TransformationTheme::new("Japanese family"));

        assert!(prompt.contains("Japanese family"));
        assert!(prompt.contains("1. person_001 (woman), wearing red coat"));
        assert!(prompt.contains("2. person_002 (person), wearing unspecified clothing"));
        assert!(prompt.contains("exactly 2 items"));
    }

    #[test]
    fn test_frame_edit_prompt_numbers_references() {
        let subjects = [
            EditSubject {
                position: "left third of the frame",
                original: "woman in a red coat",
                replacement: "30s Korean woman",
                first_reference: 2,
                reference_count: 3,
            },
            EditSubject {
                position: "right third of the frame",
                original: "man",
                replacement: "40s Korean man",
                first_reference: 5,
                reference_count: 1,
            },
        ];
        let prompt = build_frame_edit_prompt(&subjects);

        assert!(prompt.contains("shown in images 2-4 (30s Korean woman)"));
        assert!(prompt.contains("shown in image 5 (40s Korean man)"));
        assert!(prompt.contains("Background layout"));
    }

    #[test]
    fn test_portrait_prompt_mentions_original_clothing() {
        let prompt = build_portrait_prompt("30s woman", "denim jacket");
        assert!(prompt.contains("30s woman"));
        assert!(prompt.contains("original outfit: denim jacket"));
        assert!(!build_portrait_prompt("30s woman", "").contains("original outfit"));
    }
}
