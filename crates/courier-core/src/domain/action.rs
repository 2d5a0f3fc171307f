//! Task actions: the closed set of mutations the queue knows how to replay.
//!
//! Payloads only carry what a handler needs to rebuild the remote call
//! (object references, ids, timestamps). The coordinator never looks inside
//! them; it only routes on the variant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::LabelId;

/// One vCard-ish contact card as the handler will upload it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactCard {
    pub kind: CardKind,
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardKind {
    PlainText,
    Encrypted,
    Signed,
    SignedAndEncrypted,
}

/// Actions a push notification can trigger without opening the app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    MarkAsRead,
    Archive,
    MoveToTrash,
}

/// The action a task performs, with its payload.
///
/// Serialized as an internally tagged enum (`{"kind": "save_draft", ...}`)
/// so the on-disk blob stays readable and every payload round-trips.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskAction {
    // message lane
    SaveDraft {
        message_object_uri: String,
    },
    Send {
        message_object_uri: String,
    },
    UploadAttachment {
        attachment_object_uri: String,
    },
    UploadPublicKey {
        attachment_object_uri: String,
    },
    DeleteAttachment {
        attachment_id: String,
    },
    UpdateAttachmentKeyPacket {
        message_object_uri: String,
        address_id: String,
    },

    // misc lane: message state
    MarkRead {
        item_ids: Vec<String>,
        object_ids: Vec<String>,
    },
    MarkUnread {
        current_label_id: LabelId,
        item_ids: Vec<String>,
        object_ids: Vec<String>,
    },
    Delete {
        item_ids: Vec<String>,
    },
    EmptyTrash,
    EmptySpam,
    EmptyFolder {
        label_id: LabelId,
    },
    AddLabel {
        label_id: LabelId,
        item_ids: Vec<String>,
        should_fetch: bool,
    },
    RemoveLabel {
        label_id: LabelId,
        item_ids: Vec<String>,
    },
    MoveToFolder {
        from: LabelId,
        to: LabelId,
        item_ids: Vec<String>,
    },

    // misc lane: labels
    UpdateLabel {
        label_id: LabelId,
        name: String,
        color: String,
    },
    CreateLabel {
        name: String,
        color: String,
        is_folder: bool,
    },
    DeleteLabel {
        label_id: LabelId,
    },

    // misc lane: contacts
    UpdateContact {
        contact_id: String,
        cards: Vec<ContactCard>,
    },
    DeleteContact {
        contact_id: String,
    },
    AddContact {
        cards: Vec<ContactCard>,
        import_from_device: bool,
    },
    AddContacts {
        cards: Vec<Vec<ContactCard>>,
        import_from_device: bool,
    },
    AddContactGroup {
        name: String,
        color: String,
        email_ids: Vec<String>,
    },
    UpdateContactGroup {
        group_id: String,
        name: String,
        color: String,
        added_email_ids: Vec<String>,
        removed_email_ids: Vec<String>,
    },
    DeleteContactGroup {
        group_id: String,
    },
    FetchContactDetail {
        contact_ids: Vec<String>,
    },

    // misc lane: everything else
    NotificationAction {
        action: NotificationKind,
        message_id: String,
    },
    BlockSender {
        email: String,
    },
    UnblockSender {
        email: String,
    },
    Snooze {
        conversation_ids: Vec<String>,
        until: DateTime<Utc>,
    },
    Unsnooze {
        conversation_id: String,
    },

    // special cases
    Signout,
    Signin,
    /// Usually inserted by the coordinator ahead of a resumed upload.
    FetchMessageDetail,
}

/// Where `add_task` sends a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    /// Message lane, with `dependency_ids` computed from same-target tasks.
    MessageChain,
    /// Message lane, appended as is.
    Message,
    Misc,
    Signout,
    Signin,
}

impl TaskAction {
    pub fn routing(&self) -> Routing {
        use TaskAction::*;
        match self {
            SaveDraft { .. } | Send { .. } => Routing::MessageChain,
            UploadAttachment { .. }
            | UploadPublicKey { .. }
            | DeleteAttachment { .. }
            | UpdateAttachmentKeyPacket { .. }
            | FetchMessageDetail => Routing::Message,
            Signout => Routing::Signout,
            Signin => Routing::Signin,
            MarkRead { .. }
            | MarkUnread { .. }
            | Delete { .. }
            | EmptyTrash
            | EmptySpam
            | EmptyFolder { .. }
            | AddLabel { .. }
            | RemoveLabel { .. }
            | MoveToFolder { .. }
            | UpdateLabel { .. }
            | CreateLabel { .. }
            | DeleteLabel { .. }
            | UpdateContact { .. }
            | DeleteContact { .. }
            | AddContact { .. }
            | AddContacts { .. }
            | AddContactGroup { .. }
            | UpdateContactGroup { .. }
            | DeleteContactGroup { .. }
            | FetchContactDetail { .. }
            | NotificationAction { .. }
            | BlockSender { .. }
            | UnblockSender { .. }
            | Snooze { .. }
            | Unsnooze { .. } => Routing::Misc,
        }
    }

    /// Draft/send chain actions that go stale when a dependency can never
    /// be satisfied.
    pub fn is_draft_chain(&self) -> bool {
        matches!(
            self,
            TaskAction::SaveDraft { .. }
                | TaskAction::UploadAttachment { .. }
                | TaskAction::UploadPublicKey { .. }
                | TaskAction::DeleteAttachment { .. }
                | TaskAction::Send { .. }
        )
    }

    /// Uploads that could duplicate server-side state if replayed after a crash.
    pub fn is_upload(&self) -> bool {
        matches!(
            self,
            TaskAction::UploadAttachment { .. } | TaskAction::UploadPublicKey { .. }
        )
    }

    /// Actions dropped instead of kept when the handler reports a connection issue.
    pub fn is_dropped_when_offline(&self) -> bool {
        matches!(
            self,
            TaskAction::Signout | TaskAction::UploadAttachment { .. }
        )
    }

    pub fn is_signout(&self) -> bool {
        matches!(self, TaskAction::Signout)
    }

    /// Stable snake_case name, used in logs.
    pub fn name(&self) -> &'static str {
        use TaskAction::*;
        match self {
            SaveDraft { .. } => "save_draft",
            Send { .. } => "send",
            UploadAttachment { .. } => "upload_attachment",
            UploadPublicKey { .. } => "upload_public_key",
            DeleteAttachment { .. } => "delete_attachment",
            UpdateAttachmentKeyPacket { .. } => "update_attachment_key_packet",
            MarkRead { .. } => "mark_read",
            MarkUnread { .. } => "mark_unread",
            Delete { .. } => "delete",
            EmptyTrash => "empty_trash",
            EmptySpam => "empty_spam",
            EmptyFolder { .. } => "empty_folder",
            AddLabel { .. } => "add_label",
            RemoveLabel { .. } => "remove_label",
            MoveToFolder { .. } => "move_to_folder",
            UpdateLabel { .. } => "update_label",
            CreateLabel { .. } => "create_label",
            DeleteLabel { .. } => "delete_label",
            UpdateContact { .. } => "update_contact",
            DeleteContact { .. } => "delete_contact",
            AddContact { .. } => "add_contact",
            AddContacts { .. } => "add_contacts",
            AddContactGroup { .. } => "add_contact_group",
            UpdateContactGroup { .. } => "update_contact_group",
            DeleteContactGroup { .. } => "delete_contact_group",
            FetchContactDetail { .. } => "fetch_contact_detail",
            NotificationAction { .. } => "notification_action",
            BlockSender { .. } => "block_sender",
            UnblockSender { .. } => "unblock_sender",
            Snooze { .. } => "snooze",
            Unsnooze { .. } => "unsnooze",
            Signout => "signout",
            Signin => "signin",
            FetchMessageDetail => "fetch_message_detail",
        }
    }
}
