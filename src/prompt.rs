use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

macro_rules! id_photo_prompt {
    ($background:literal) => {
        concat!(
            "Using the person in the uploaded photo, produce a realistic, professional ID portrait ",
            "suitable for official documents and workplace profiles.\n\n",
            "Identity: keep facial features, face shape, gender, age and overall character exactly as in ",
            "the source photo. Natural, calm expression with a slight, confident smile. Eyes look straight ",
            "into the camera.\n\n",
            "Hair and face: keep the original hairstyle and length, only tidied; no stray hairs, no styling ",
            "artifacts. Keep the hairline and volume realistic. Gently correct asymmetry caused by camera ",
            "angle or expression without reshaping bone structure or applying beauty filters.\n\n",
            "Composition: frontal head-and-shoulders portrait, subject centered. If the top of the head is ",
            "cropped in the source, complete it naturally and leave headroom away from the frame edge.\n\n",
            "Wardrobe: dark business suit jacket over a light shirt; formal, simple, not fashion-styled.\n\n",
            "Background and lighting: ",
            $background,
            ", clean with no objects. No lamps, stands, studio gear or camera equipment in frame. Soft, even ",
            "commercial portrait lighting with no hard shadows; show the light, never the fixtures.\n\n",
            "Format: portrait orientation, aspect ratio 2:3. Restrained, authentic, high-quality ID photo ",
            "fit for long-term formal use."
        )
    };
}

const WHITE_PROMPT: &str = id_photo_prompt!("plain pure white minimal background");
const BLUE_PROMPT: &str = id_photo_prompt!("plain pure blue minimal background");
const RED_PROMPT: &str = id_photo_prompt!("plain pure red minimal background");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BgColor {
    #[default]
    White,
    Blue,
    Red,
}

impl BgColor {
    pub const ALL: [BgColor; 3] = [BgColor::White, BgColor::Blue, BgColor::Red];

    pub fn as_str(self) -> &'static str {
        match self {
            BgColor::White => "white",
            BgColor::Blue => "blue",
            BgColor::Red => "red",
        }
    }

    /// Generation prompt for this background.
    pub fn prompt(self) -> &'static str {
        match self {
            BgColor::White => WHITE_PROMPT,
            BgColor::Blue => BLUE_PROMPT,
            BgColor::Red => RED_PROMPT,
        }
    }
}

impl FromStr for BgColor {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        BgColor::ALL
            .into_iter()
            .find(|color| color.as_str() == value)
            .ok_or(())
    }
}

impl fmt::Display for BgColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
