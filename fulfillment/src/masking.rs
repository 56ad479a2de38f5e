//! Participant PII masking at the response boundary.
//!
//! A pure function over name/email: stored data is never altered by the
//! disclosure level, and the level a caller actually gets is capped by their
//! role. `Full` is only served to callers holding the full-PII permission.

use crate::actor::{Actor, Permission};
use crate::config::PiiDisclosure;

/// The disclosure level `actor` effectively receives under `policy`.
#[must_use]
pub fn effective_disclosure(policy: PiiDisclosure, actor: &Actor) -> PiiDisclosure {
    match policy {
        PiiDisclosure::Full if actor.role.allows(Permission::ViewFullPii) => PiiDisclosure::Full,
        PiiDisclosure::Full | PiiDisclosure::Masked => PiiDisclosure::Masked,
        PiiDisclosure::None => PiiDisclosure::None,
    }
}

/// Apply a disclosure level to a participant name.
#[must_use]
pub fn disclose_name(name: &str, level: PiiDisclosure) -> Option<String> {
    match level {
        PiiDisclosure::None => None,
        PiiDisclosure::Masked => Some(mask_name(name)),
        PiiDisclosure::Full => Some(name.to_string()),
    }
}

/// Apply a disclosure level to a participant email.
#[must_use]
pub fn disclose_email(email: &str, level: PiiDisclosure) -> Option<String> {
    match level {
        PiiDisclosure::None => None,
        PiiDisclosure::Masked => Some(mask_email(email)),
        PiiDisclosure::Full => Some(email.to_string()),
    }
}

/// Keep the first letter of each word: "Jane Doe" → "J. D."
fn mask_name(name: &str) -> String {
    let initials: Vec<String> = name
        .split_whitespace()
        .filter_map(|word| word.chars().next())
        .map(|c| format!("{c}."))
        .collect();
    if initials.is_empty() {
        "?".to_string()
    } else {
        initials.join(" ")
    }
}

/// Keep the first character of the local part and the full domain:
/// "jane.doe@example.com" → "j***@example.com"
fn mask_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, domain)) => {
            let first = local.chars().next().map(String::from).unwrap_or_default();
            format!("{first}***@{domain}")
        }
        None => "***".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::Role;
    use crate::types::UserId;

    #[test]
    fn masking_keeps_initials_and_domain() {
        assert_eq!(mask_name("Jane Doe"), "J. D.");
        assert_eq!(mask_name("Prince"), "P.");
        assert_eq!(mask_name(""), "?");
        assert_eq!(mask_email("jane.doe@example.com"), "j***@example.com");
        assert_eq!(mask_email("not-an-email"), "***");
    }

    #[test]
    fn none_level_discloses_nothing() {
        assert_eq!(disclose_name("Jane Doe", PiiDisclosure::None), None);
        assert_eq!(disclose_email("jane@example.com", PiiDisclosure::None), None);
    }

    #[test]
    fn full_is_capped_for_unprivileged_actors() {
        let staff = Actor { user_id: Some(UserId::new()), email: None, role: Role::GateStaff };
        let organizer = Actor { user_id: Some(UserId::new()), email: None, role: Role::Organizer };

        assert_eq!(effective_disclosure(PiiDisclosure::Full, &staff), PiiDisclosure::Masked);
        assert_eq!(effective_disclosure(PiiDisclosure::Full, &organizer), PiiDisclosure::Full);
        assert_eq!(effective_disclosure(PiiDisclosure::None, &organizer), PiiDisclosure::None);
    }

    #[test]
    fn masked_output_never_contains_the_local_part() {
        let masked = mask_email("secret.person@example.com");
        assert!(!masked.contains("secret.person"));
        assert!(masked.starts_with("s***@"));
    }
}
