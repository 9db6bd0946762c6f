//! Unlock gate: a document is editable only once its customer record carries
//! a name and a plausible phone number.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::scene::SubjectId;

/// Validation rules for the companion record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockRules {
    /// Accepted phone prefixes; empty accepts any prefix
    pub phone_prefixes: Vec<String>,
    pub min_phone_digits: usize,
}

impl Default for UnlockRules {
    fn default() -> Self {
        Self {
            phone_prefixes: vec!["+".to_string()],
            min_phone_digits: 7,
        }
    }
}

impl UnlockRules {
    pub fn name_ok(&self, name: Option<&str>) -> bool {
        name.map(|n| !n.trim().is_empty()).unwrap_or(false)
    }

    pub fn phone_ok(&self, phone: Option<&str>) -> bool {
        let Some(phone) = phone.map(str::trim).filter(|p| !p.is_empty()) else {
            return false;
        };

        let prefix_ok = self.phone_prefixes.is_empty()
            || self.phone_prefixes.iter().any(|p| phone.starts_with(p.as_str()));
        let digits = phone.chars().filter(char::is_ascii_digit).count();

        prefix_ok && digits >= self.min_phone_digits
    }
}

/// Customer fields the gate validates
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanionRecord {
    pub name: Option<String>,
    pub phone: Option<String>,
}

impl CompanionRecord {
    pub fn new(name: impl Into<String>, phone: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            phone: Some(phone.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompanionField {
    Name,
    Phone,
}

#[derive(Debug, Clone)]
pub struct UnlockGate {
    rules: UnlockRules,
    subject: Option<SubjectId>,
    record: CompanionRecord,
    unlocked: bool,
}

impl UnlockGate {
    pub fn new(rules: UnlockRules) -> Self {
        Self {
            rules,
            subject: None,
            record: CompanionRecord::default(),
            unlocked: false,
        }
    }

    /// Rebind to a subject; validation data of the previous one is dropped
    pub fn bind(&mut self, subject: Option<SubjectId>) {
        self.subject = subject.filter(SubjectId::is_real);
        self.record = CompanionRecord::default();
        self.unlocked = false;
    }

    /// Companion record delivered for `subject`. Returns whether the gate flipped.
    pub fn companion_loaded(&mut self, subject: &SubjectId, record: CompanionRecord) -> bool {
        if self.subject.as_ref() != Some(subject) {
            debug!("Ignoring companion record for unbound subject {}", subject);
            return false;
        }
        self.record = record;
        self.recompute()
    }

    /// One cell of the companion record grid loaded. Only row 0 belongs to
    /// the bound subject.
    pub fn cell_loaded(
        &mut self,
        subject: &SubjectId,
        row: usize,
        field: CompanionField,
        value: Option<String>,
    ) -> bool {
        if row != 0 || self.subject.as_ref() != Some(subject) {
            return false;
        }
        match field {
            CompanionField::Name => self.record.name = value,
            CompanionField::Phone => self.record.phone = value,
        }
        self.recompute()
    }

    /// Re-evaluate the rules. Returns whether the gate flipped.
    pub fn recompute(&mut self) -> bool {
        let unlocked = self.subject.is_some()
            && self.rules.name_ok(self.record.name.as_deref())
            && self.rules.phone_ok(self.record.phone.as_deref());

        let changed = unlocked != self.unlocked;
        if changed {
            info!(
                "Document {} {}",
                self.subject.as_ref().map(SubjectId::as_str).unwrap_or("-"),
                if unlocked { "unlocked" } else { "locked" }
            );
        }
        self.unlocked = unlocked;
        changed
    }

    pub fn is_unlocked(&self) -> bool {
        self.unlocked
    }

    pub fn subject(&self) -> Option<&SubjectId> {
        self.subject.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound(subject: &str) -> UnlockGate {
        let mut gate = UnlockGate::new(UnlockRules::default());
        gate.bind(Some(SubjectId::new(subject)));
        gate
    }

    #[test]
    fn test_phone_rules() {
        let rules = UnlockRules::default();
        assert!(rules.phone_ok(Some("+254 712 345 678")));
        assert!(!rules.phone_ok(Some("0712345678")));
        assert!(!rules.phone_ok(Some("+12")));
        assert!(!rules.phone_ok(Some("   ")));
        assert!(!rules.phone_ok(None));

        let any_prefix = UnlockRules {
            phone_prefixes: vec![],
            min_phone_digits: 7,
        };
        assert!(any_prefix.phone_ok(Some("0712345678")));
    }

    #[test]
    fn test_unlocks_with_valid_record() {
        let mut gate = bound("201");
        assert!(!gate.is_unlocked());

        assert!(gate.companion_loaded(&SubjectId::new("201"), CompanionRecord::new("Ada", "+2547123456")));
        assert!(gate.is_unlocked());
    }

    #[test]
    fn test_blank_name_or_phone_stays_locked() {
        let mut gate = bound("201");
        gate.companion_loaded(&SubjectId::new("201"), CompanionRecord::new("  ", "+2547123456"));
        assert!(!gate.is_unlocked());

        gate.companion_loaded(&SubjectId::new("201"), CompanionRecord::new("Ada", ""));
        assert!(!gate.is_unlocked());
    }

    #[test]
    fn test_other_subject_ignored() {
        let mut gate = bound("201");
        assert!(!gate.companion_loaded(&SubjectId::new("305"), CompanionRecord::new("Ada", "+2547123456")));
        assert!(!gate.is_unlocked());
    }

    #[test]
    fn test_cell_loaded_row_zero_only() {
        let mut gate = bound("201");
        let subject = SubjectId::new("201");
        gate.cell_loaded(&subject, 0, CompanionField::Name, Some("Ada".into()));

        assert!(!gate.cell_loaded(&subject, 1, CompanionField::Phone, Some("+2547123456".into())));
        assert!(!gate.is_unlocked());

        assert!(gate.cell_loaded(&subject, 0, CompanionField::Phone, Some("+2547123456".into())));
        assert!(gate.is_unlocked());
    }

    #[test]
    fn test_template_and_rebind_lock() {
        let mut gate = UnlockGate::new(UnlockRules::default());
        gate.bind(Some(SubjectId::template()));
        gate.recompute();
        assert!(!gate.is_unlocked());

        let mut gate = bound("201");
        gate.companion_loaded(&SubjectId::new("201"), CompanionRecord::new("Ada", "+2547123456"));
        gate.bind(Some(SubjectId::new("305")));
        assert!(!gate.is_unlocked());
    }
}
