//! Input checks applied before anything reaches the store.

use crate::error::SyncError;
use crate::model::NewCard;

pub const LIST_TITLE_MAX: usize = 50;
pub const CARD_TITLE_MAX: usize = 100;
pub const CARD_DESCRIPTION_MAX: usize = 500;

fn title(kind: &str, raw: &str, max: usize) -> Result<String, SyncError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SyncError::InvalidArgument(format!("{kind} title is required")));
    }
    if trimmed.chars().count() > max {
        return Err(SyncError::InvalidArgument(format!(
            "{kind} title must be at most {max} characters"
        )));
    }
    Ok(trimmed.to_string())
}

/// Returns the trimmed title.
pub fn list_title(raw: &str) -> Result<String, SyncError> {
    title("list", raw, LIST_TITLE_MAX)
}

/// Returns the trimmed title.
pub fn card_title(raw: &str) -> Result<String, SyncError> {
    title("card", raw, CARD_TITLE_MAX)
}

pub fn card_description(raw: &str) -> Result<(), SyncError> {
    if raw.chars().count() > CARD_DESCRIPTION_MAX {
        return Err(SyncError::InvalidArgument(format!(
            "card description must be at most {CARD_DESCRIPTION_MAX} characters"
        )));
    }
    Ok(())
}

/// Validate and normalize a card before creation.
pub fn new_card(card: NewCard) -> Result<NewCard, SyncError> {
    let title = card_title(&card.title)?;
    card_description(&card.description)?;
    Ok(NewCard { title, ..card })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_title_limits() {
        assert_eq!(list_title("  Backlog ").unwrap(), "Backlog");
        assert!(list_title("   ").is_err());
        assert!(list_title(&"x".repeat(50)).is_ok());
        assert!(list_title(&"x".repeat(51)).is_err());
    }

    #[test]
    fn test_card_limits() {
        assert!(card_title(&"y".repeat(100)).is_ok());
        assert!(card_title(&"y".repeat(101)).is_err());
        assert!(card_description(&"z".repeat(500)).is_ok());
        assert!(matches!(
            card_description(&"z".repeat(501)),
            Err(SyncError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_new_card_trims_title() {
        let card = new_card(NewCard::titled(" Fix login ")).unwrap();
        assert_eq!(card.title, "Fix login");
    }
}
