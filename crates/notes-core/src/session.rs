//! Per-instance editing context owned by the application shell.

use crate::store::Revision;

/// Which note is open, its unsaved draft, and whether a historical revision
/// is being viewed instead of the working copy.
#[derive(Debug, Clone, Default)]
pub struct Session {
    current: Option<String>,
    draft: Option<String>,
    /// Local tip the draft was written against, once the engine has seen it.
    draft_base: Option<Revision>,
    viewing: Option<Revision>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a note for editing. Any previous draft is dropped.
    pub fn open(&mut self, id: impl Into<String>) {
        self.current = Some(id.into());
        self.draft = None;
        self.draft_base = None;
        self.viewing = None;
    }

    pub fn close(&mut self) {
        *self = Self::default();
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Replace the draft body of the open note. Ignored when nothing is open.
    pub fn edit(&mut self, body: impl Into<String>) {
        if self.current.is_some() {
            self.draft = Some(body.into());
        }
    }

    pub fn draft(&self) -> Option<&str> {
        self.draft.as_deref()
    }

    pub fn has_unsaved_edits(&self) -> bool {
        self.current.is_some() && self.draft.is_some()
    }

    pub fn discard_edits(&mut self) {
        self.draft = None;
        self.draft_base = None;
    }

    pub(crate) fn draft_base(&self) -> Option<&Revision> {
        self.draft_base.as_ref()
    }

    /// Pin the draft to `base` unless it is already pinned.
    pub(crate) fn pin_draft(&mut self, base: Revision) {
        if self.has_unsaved_edits() && self.draft_base.is_none() {
            self.draft_base = Some(base);
        }
    }

    /// Replace the draft with `body`, now written against `base`.
    pub(crate) fn rebase_draft(&mut self, body: String, base: Option<Revision>) {
        if self.current.is_some() {
            self.draft = Some(body);
            self.draft_base = base;
        }
    }

    pub(crate) fn view(&mut self, id: impl Into<String>, revision: Revision) {
        self.current = Some(id.into());
        self.draft = None;
        self.draft_base = None;
        self.viewing = Some(revision);
    }

    pub fn viewing(&self) -> Option<&Revision> {
        self.viewing.as_ref()
    }

    pub fn is_viewing_history(&self) -> bool {
        self.viewing.is_some()
    }

    pub fn exit_history(&mut self) {
        self.viewing = None;
    }

    /// Destructive operations need the user's consent when this is true.
    pub fn has_state_at_stake(&self) -> bool {
        self.has_unsaved_edits() || self.is_viewing_history()
    }
}
