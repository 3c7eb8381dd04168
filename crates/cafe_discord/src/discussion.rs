//! Discussion questions posted by the bot, and the votes they collected.

use cafe_core::ai::ScoredQuestion;
use serenity::all::{Message, ReactionType, UserId};

/// Title of the embed every discussion question is posted under.
pub const DISCUSSION_TITLE: &str = "☁️ Discussion DevOps/Cloud du Jour";

pub const UPVOTE: &str = "👍";
pub const DOWNVOTE: &str = "👎";

/// Votes on a message, not counting the bot's own seed reactions.
pub fn vote_score(reactions: &[(String, u64, bool)]) -> i64 {
    reactions
        .iter()
        .map(|(emoji, count, me)| {
            let votes = count.saturating_sub(u64::from(*me)) as i64;
            match emoji.as_str() {
                UPVOTE => votes,
                DOWNVOTE => -votes,
                _ => 0,
            }
        })
        .sum()
}

/// Strip leading emoji the model sometimes puts in front of a question.
pub fn clean_question(raw: &str) -> String {
    raw.trim()
        .trim_start_matches(|c: char| !c.is_alphanumeric() && !c.is_whitespace() && !c.is_ascii_punctuation())
        .trim()
        .to_string()
}

/// Earlier questions posted by `bot_id` among `messages`, with their scores.
pub fn scored_questions(messages: &[Message], bot_id: UserId) -> Vec<ScoredQuestion> {
    messages
        .iter()
        .filter(|m| m.author.id == bot_id)
        .filter_map(|m| {
            let embed = m.embeds.first()?;
            if embed.title.as_deref() != Some(DISCUSSION_TITLE) {
                return None;
            }
            let question = clean_question(embed.description.as_deref()?);
            if question.is_empty() {
                return None;
            }
            let reactions: Vec<(String, u64, bool)> = m
                .reactions
                .iter()
                .filter_map(|r| match &r.reaction_type {
                    ReactionType::Unicode(emoji) => Some((emoji.clone(), r.count, r.me)),
                    _ => None,
                })
                .collect();
            Some(ScoredQuestion {
                question,
                score: vote_score(&reactions),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vote_score_ignores_own_seed() {
        let reactions = vec![
            (UPVOTE.to_string(), 5, true),
            (DOWNVOTE.to_string(), 2, false),
            ("🤔".to_string(), 7, true),
        ];
        assert_eq!(vote_score(&reactions), 4 - 2);
        assert_eq!(vote_score(&[]), 0);
        assert_eq!(vote_score(&[(UPVOTE.to_string(), 1, true)]), 0);
    }

    #[test]
    fn test_clean_question() {
        assert_eq!(clean_question("📦 Votre outil IaC préféré ?"), "Votre outil IaC préféré ?");
        assert_eq!(clean_question("  Kubernetes en prod ?  "), "Kubernetes en prod ?");
        assert_eq!(clean_question("🔐☁️"), "");
    }
}
