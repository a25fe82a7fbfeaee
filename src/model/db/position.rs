use std::ops::Deref;

use serde::{Deserialize, Serialize};

use crate::model::mongodb::Id;

/// Core contestable position data, as stored in the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionCore {
    /// Display name. A class-restricted position encodes the represented
    /// class as the first integer in its name, e.g. "Grade 11 Representative".
    pub name: String,
    /// Maximum number of candidates selectable for this position.
    pub max_votes: u32,
    /// Sort key for ballot display.
    pub display_order: u32,
    /// Inactive positions never appear on ballots and cannot be voted on.
    pub active: bool,
}

/// A position from the database, with its unique ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    #[serde(rename = "_id")]
    pub id: Id,
    #[serde(flatten)]
    pub position: PositionCore,
}

impl Position {
    /// The class this position represents, if its name encodes one.
    ///
    /// The first run of digits in the name is taken as the class number;
    /// names without digits denote unrestricted positions.
    pub fn represented_class(&self) -> Option<u8> {
        let digits: String = self
            .name
            .chars()
            .skip_while(|c| !c.is_ascii_digit())
            .take_while(|c| c.is_ascii_digit())
            .collect();
        digits.parse::<u8>().ok()
    }

    /// May a voter of the given eligibility class see this position?
    ///
    /// A position representing class N is only contestable by voters whose
    /// next class equals N, and never when N exceeds the highest class.
    pub fn eligible_for(&self, class_level: u8, max_class_level: u8) -> bool {
        match self.represented_class() {
            None => true,
            Some(n) => {
                n <= max_class_level && u16::from(class_level) + 1 == u16::from(n)
            }
        }
    }
}

impl Deref for Position {
    type Target = PositionCore;

    fn deref(&self) -> &Self::Target {
        &self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    impl Position {
        pub fn named(name: &str, max_votes: u32) -> Self {
            Self {
                id: Id::new(),
                position: PositionCore {
                    name: name.to_string(),
                    max_votes,
                    display_order: 0,
                    active: true,
                },
            }
        }
    }

    #[test]
    fn class_parsing() {
        assert_eq!(
            Position::named("Grade 11 Representative", 1).represented_class(),
            Some(11)
        );
        assert_eq!(
            Position::named("Representative, Grade 9", 1).represented_class(),
            Some(9)
        );
        assert_eq!(Position::named("President", 1).represented_class(), None);
        // Digit runs too large for a class number are not a restriction match.
        assert_eq!(
            Position::named("Batch 2026 Representative", 1).represented_class(),
            None
        );
    }

    #[test]
    fn eligibility_for_next_class() {
        let grade11 = Position::named("Grade 11 Representative", 1);
        let grade9 = Position::named("Grade 9 Representative", 1);
        let president = Position::named("President", 1);

        // A class-10 voter elects next year's class-11 representative.
        assert!(grade11.eligible_for(10, 12));
        assert!(!grade9.eligible_for(10, 12));
        assert!(president.eligible_for(10, 12));
    }

    #[test]
    fn eligibility_respects_max_class() {
        let grade13 = Position::named("Grade 13 Representative", 1);
        // There is no class 13, so nobody may see this position.
        assert!(!grade13.eligible_for(12, 12));
    }
}
