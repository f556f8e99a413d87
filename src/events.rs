//! Domain event kinds delivered to external webhook subscribers.
//!
//! The set is closed: subscriber `events` filters and the test endpoint
//! both validate against it, so a typo in a subscriber definition fails
//! at configuration time instead of silently never matching.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    ApplicationStartup,
    InstanceCreate,
    InstanceDelete,
    QrcodeUpdated,
    MessagesSet,
    MessagesUpsert,
    MessagesEdited,
    MessagesUpdate,
    MessagesDelete,
    SendMessage,
    SendMessageUpdate,
    ContactsSet,
    ContactsUpdate,
    ContactsUpsert,
    PresenceUpdate,
    ChatsSet,
    ChatsUpdate,
    ChatsDelete,
    ChatsUpsert,
    ConnectionUpdate,
    LabelsEdit,
    LabelsAssociation,
    GroupsUpsert,
    GroupUpdate,
    GroupParticipantsUpdate,
    Call,
    TypebotStart,
    TypebotChangeStatus,
    Errors,
}

impl EventKind {
    pub const ALL: [EventKind; 29] = [
        EventKind::ApplicationStartup,
        EventKind::InstanceCreate,
        EventKind::InstanceDelete,
        EventKind::QrcodeUpdated,
        EventKind::MessagesSet,
        EventKind::MessagesUpsert,
        EventKind::MessagesEdited,
        EventKind::MessagesUpdate,
        EventKind::MessagesDelete,
        EventKind::SendMessage,
        EventKind::SendMessageUpdate,
        EventKind::ContactsSet,
        EventKind::ContactsUpdate,
        EventKind::ContactsUpsert,
        EventKind::PresenceUpdate,
        EventKind::ChatsSet,
        EventKind::ChatsUpdate,
        EventKind::ChatsDelete,
        EventKind::ChatsUpsert,
        EventKind::ConnectionUpdate,
        EventKind::LabelsEdit,
        EventKind::LabelsAssociation,
        EventKind::GroupsUpsert,
        EventKind::GroupUpdate,
        EventKind::GroupParticipantsUpdate,
        EventKind::Call,
        EventKind::TypebotStart,
        EventKind::TypebotChangeStatus,
        EventKind::Errors,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ApplicationStartup => "APPLICATION_STARTUP",
            EventKind::InstanceCreate => "INSTANCE_CREATE",
            EventKind::InstanceDelete => "INSTANCE_DELETE",
            EventKind::QrcodeUpdated => "QRCODE_UPDATED",
            EventKind::MessagesSet => "MESSAGES_SET",
            EventKind::MessagesUpsert => "MESSAGES_UPSERT",
            EventKind::MessagesEdited => "MESSAGES_EDITED",
            EventKind::MessagesUpdate => "MESSAGES_UPDATE",
            EventKind::MessagesDelete => "MESSAGES_DELETE",
            EventKind::SendMessage => "SEND_MESSAGE",
            EventKind::SendMessageUpdate => "SEND_MESSAGE_UPDATE",
            EventKind::ContactsSet => "CONTACTS_SET",
            EventKind::ContactsUpdate => "CONTACTS_UPDATE",
            EventKind::ContactsUpsert => "CONTACTS_UPSERT",
            EventKind::PresenceUpdate => "PRESENCE_UPDATE",
            EventKind::ChatsSet => "CHATS_SET",
            EventKind::ChatsUpdate => "CHATS_UPDATE",
            EventKind::ChatsDelete => "CHATS_DELETE",
            EventKind::ChatsUpsert => "CHATS_UPSERT",
            EventKind::ConnectionUpdate => "CONNECTION_UPDATE",
            EventKind::LabelsEdit => "LABELS_EDIT",
            EventKind::LabelsAssociation => "LABELS_ASSOCIATION",
            EventKind::GroupsUpsert => "GROUPS_UPSERT",
            EventKind::GroupUpdate => "GROUP_UPDATE",
            EventKind::GroupParticipantsUpdate => "GROUP_PARTICIPANTS_UPDATE",
            EventKind::Call => "CALL",
            EventKind::TypebotStart => "TYPEBOT_START",
            EventKind::TypebotChangeStatus => "TYPEBOT_CHANGE_STATUS",
            EventKind::Errors => "ERRORS",
        }
    }

    /// Parse an event-kind string. Unknown names are a validation error.
    pub fn parse(s: &str) -> Option<EventKind> {
        EventKind::ALL.iter().copied().find(|k| k.as_str() == s)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
