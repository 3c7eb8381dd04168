//! Coffee-themed rank table.

/// One rank of the XP ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rank {
    pub level: u8,
    /// Also the name of the Discord role for this rank.
    pub name: &'static str,
    pub description: &'static str,
    pub xp_required: u64,
    pub color: u32,
    pub emoji: &'static str,
}

pub const RANKS: [Rank; 10] = [
    Rank {
        level: 1,
        name: "🌱︱Grain",
        description: "Le début de tout",
        xp_required: 0,
        color: 0x1565c0,
        emoji: "🌱",
    },
    Rank {
        level: 2,
        name: "🫘︱Robusta",
        description: "Café corsé et fort",
        xp_required: 100,
        color: 0x2196f3,
        emoji: "🫘",
    },
    Rank {
        level: 3,
        name: "☕︱Arabica",
        description: "Plus raffiné",
        xp_required: 300,
        color: 0x00bcd4,
        emoji: "☕",
    },
    Rank {
        level: 4,
        name: "🔥︱Espresso",
        description: "Intense et concentré",
        xp_required: 600,
        color: 0x00e676,
        emoji: "🔥",
    },
    Rank {
        level: 5,
        name: "⚡︱Ristretto",
        description: "Ultra concentré",
        xp_required: 1000,
        color: 0x6a1b9a,
        emoji: "⚡",
    },
    Rank {
        level: 6,
        name: "💧︱Lungo",
        description: "Version allongée",
        xp_required: 1500,
        color: 0x9c27b0,
        emoji: "💧",
    },
    Rank {
        level: 7,
        name: "☁️︱Cappuccino",
        description: "Mousse crémeuse",
        xp_required: 2200,
        color: 0xe91e63,
        emoji: "☁️",
    },
    Rank {
        level: 8,
        name: "🎨︱Macchiato",
        description: "Taché de lait",
        xp_required: 3000,
        color: 0xff5722,
        emoji: "🎨",
    },
    Rank {
        level: 9,
        name: "🍨︱Affogato",
        description: "Café glacé",
        xp_required: 4000,
        color: 0xff9800,
        emoji: "🍨",
    },
    Rank {
        level: 10,
        name: "👑︱Moka",
        description: "Le summum",
        xp_required: 5500,
        color: 0xffd700,
        emoji: "👑",
    },
];

/// The rank with this level, or the first rank.
pub fn rank_by_level(level: u8) -> &'static Rank {
    RANKS
        .iter()
        .find(|rank| rank.level == level)
        .unwrap_or(&RANKS[0])
}

/// Highest rank whose threshold `xp` reaches.
pub fn rank_by_xp(xp: u64) -> &'static Rank {
    RANKS
        .iter()
        .take_while(|rank| xp >= rank.xp_required)
        .last()
        .unwrap_or(&RANKS[0])
}

pub fn next_rank(level: u8) -> Option<&'static Rank> {
    RANKS.iter().find(|rank| rank.level == level.saturating_add(1))
}

/// XP still missing for the next rank; 0 at the top.
pub fn xp_to_next_rank(xp: u64) -> u64 {
    next_rank(rank_by_xp(xp).level)
        .map(|next| next.xp_required.saturating_sub(xp))
        .unwrap_or(0)
}

/// Whole-percent progress through the current rank; 100 at the top.
pub fn rank_progress(xp: u64) -> u8 {
    let current = rank_by_xp(xp);
    let Some(next) = next_rank(current.level) else {
        return 100;
    };
    let into_rank = xp - current.xp_required;
    let span = next.xp_required - current.xp_required;
    (into_rank * 100 / span) as u8
}

/// Whether a role name belongs to the rank ladder.
pub fn is_rank_role(role_name: &str) -> bool {
    RANKS.iter().any(|rank| rank.name == role_name)
}
