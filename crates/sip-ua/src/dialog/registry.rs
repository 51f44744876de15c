// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Process-wide dialog registry.
//!
//! The registry is the single point of truth for dialog lifetime: owners keep
//! [`DialogId`] keys, never owning references. Removal happens through the
//! owning entity's terminate path.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use sip_msg::{Request, TargetDialog};

use super::{Dialog, DialogId};

/// Shared handle to a registered dialog.
pub type DialogRef = Arc<Mutex<Dialog>>;

/// Mapping from dialog id to dialog.
#[derive(Clone, Default)]
pub struct DialogRegistry {
    dialogs: Arc<DashMap<DialogId, DialogRef>>,
}

impl DialogRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a dialog, returning the shared handle. An existing dialog
    /// under the same id is replaced (2xx re-creation of an early dialog).
    pub fn insert(&self, dialog: Dialog) -> DialogRef {
        let id = dialog.id.clone();
        let handle = Arc::new(Mutex::new(dialog));
        self.dialogs.insert(id, handle.clone());
        handle
    }

    pub fn get(&self, id: &DialogId) -> Option<DialogRef> {
        self.dialogs.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &DialogId) -> bool {
        self.dialogs.contains_key(id)
    }

    pub fn remove(&self, id: &DialogId) -> Option<DialogRef> {
        self.dialogs.remove(id).map(|(_, dialog)| dialog)
    }

    /// Finds the dialog an incoming in-dialog request belongs to.
    pub fn find_for_request(&self, req: &Request) -> Option<DialogRef> {
        let id = DialogId::from_incoming_request(req)?;
        self.get(&id)
    }

    /// Resolves an RFC 4538 Target-Dialog header. The header's tags are the
    /// sender's view, so they swap when forming our key.
    pub fn find_target_dialog(&self, td: &TargetDialog) -> Option<DialogRef> {
        let id = DialogId::new(
            td.call_id.clone(),
            td.remote_tag.clone(),
            td.local_tag.clone(),
        );
        self.get(&id)
    }

    pub fn len(&self) -> usize {
        self.dialogs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dialogs.is_empty()
    }
}
