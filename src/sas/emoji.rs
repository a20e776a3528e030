// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fixed table mapping a 6-bit index to a comparison emoji.
//!
//! The table is shared by all interoperating implementations and must never be reordered.

/// One entry of the emoji comparison alphabet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SasEmoji {
    pub symbol: &'static str,
    pub description: &'static str,
}

/// Lookup by 6-bit index. Exhaustive by construction; only the low 6 bits are considered.
pub fn sas_emoji(index: u8) -> SasEmoji {
    SAS_EMOJI_TABLE[usize::from(index & 0x3f)]
}

pub const SAS_EMOJI_TABLE: [SasEmoji; 64] = [
    SasEmoji { symbol: "🐶", description: "Dog" },
    SasEmoji { symbol: "🐱", description: "Cat" },
    SasEmoji { symbol: "🦁", description: "Lion" },
    SasEmoji { symbol: "🐴", description: "Horse" },
    SasEmoji { symbol: "🦄", description: "Unicorn" },
    SasEmoji { symbol: "🐷", description: "Pig" },
    SasEmoji { symbol: "🐘", description: "Elephant" },
    SasEmoji { symbol: "🐰", description: "Rabbit" },
    SasEmoji { symbol: "🐼", description: "Panda" },
    SasEmoji { symbol: "🐓", description: "Rooster" },
    SasEmoji { symbol: "🐧", description: "Penguin" },
    SasEmoji { symbol: "🐢", description: "Turtle" },
    SasEmoji { symbol: "🐟", description: "Fish" },
    SasEmoji { symbol: "🐙", description: "Octopus" },
    SasEmoji { symbol: "🦋", description: "Butterfly" },
    SasEmoji { symbol: "🌷", description: "Flower" },
    SasEmoji { symbol: "🌳", description: "Tree" },
    SasEmoji { symbol: "🌵", description: "Cactus" },
    SasEmoji { symbol: "🍄", description: "Mushroom" },
    SasEmoji { symbol: "🌏", description: "Globe" },
    SasEmoji { symbol: "🌙", description: "Moon" },
    SasEmoji { symbol: "☁️", description: "Cloud" },
    SasEmoji { symbol: "🔥", description: "Fire" },
    SasEmoji { symbol: "🍌", description: "Banana" },
    SasEmoji { symbol: "🍎", description: "Apple" },
    SasEmoji { symbol: "🍓", description: "Strawberry" },
    SasEmoji { symbol: "🌽", description: "Corn" },
    SasEmoji { symbol: "🍕", description: "Pizza" },
    SasEmoji { symbol: "🎂", description: "Cake" },
    SasEmoji { symbol: "❤️", description: "Heart" },
    SasEmoji { symbol: "😀", description: "Smiley" },
    SasEmoji { symbol: "🤖", description: "Robot" },
    SasEmoji { symbol: "🎩", description: "Hat" },
    SasEmoji { symbol: "👓", description: "Glasses" },
    SasEmoji { symbol: "🔧", description: "Spanner" },
    SasEmoji { symbol: "🎅", description: "Santa" },
    SasEmoji { symbol: "👍", description: "Thumbs Up" },
    SasEmoji { symbol: "☂️", description: "Umbrella" },
    SasEmoji { symbol: "⌛", description: "Hourglass" },
    SasEmoji { symbol: "⏰", description: "Clock" },
    SasEmoji { symbol: "🎁", description: "Gift" },
    SasEmoji { symbol: "💡", description: "Light Bulb" },
    SasEmoji { symbol: "📕", description: "Book" },
    SasEmoji { symbol: "✏️", description: "Pencil" },
    SasEmoji { symbol: "📎", description: "Paperclip" },
    SasEmoji { symbol: "✂️", description: "Scissors" },
    SasEmoji { symbol: "🔒", description: "Lock" },
    SasEmoji { symbol: "🔑", description: "Key" },
    SasEmoji { symbol: "🔨", description: "Hammer" },
    SasEmoji { symbol: "☎️", description: "Telephone" },
    SasEmoji { symbol: "🏁", description: "Flag" },
    SasEmoji { symbol: "🚂", description: "Train" },
    SasEmoji { symbol: "🚲", description: "Bicycle" },
    SasEmoji { symbol: "✈️", description: "Aeroplane" },
    SasEmoji { symbol: "🚀", description: "Rocket" },
    SasEmoji { symbol: "🏆", description: "Trophy" },
    SasEmoji { symbol: "⚽", description: "Ball" },
    SasEmoji { symbol: "🎸", description: "Guitar" },
    SasEmoji { symbol: "🎺", description: "Trumpet" },
    SasEmoji { symbol: "🔔", description: "Bell" },
    SasEmoji { symbol: "⚓", description: "Anchor" },
    SasEmoji { symbol: "🎧", description: "Headphones" },
    SasEmoji { symbol: "📁", description: "Folder" },
    SasEmoji { symbol: "📌", description: "Pin" },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_complete() {
        assert_eq!(SAS_EMOJI_TABLE.len(), 64);
        assert_eq!(sas_emoji(0).description, "Dog");
        assert_eq!(sas_emoji(47).description, "Key");
        assert_eq!(sas_emoji(63).description, "Pin");
        // Only the low 6 bits select an entry.
        assert_eq!(sas_emoji(64), sas_emoji(0));
    }
}
