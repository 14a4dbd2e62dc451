use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::user::UserIdentity;
use crate::value_objects::{MessageId, RoomName, Timestamp, UserId};

/// 软删除后替换正文的占位文本。
pub const DELETED_PLACEHOLDER: &str = "This message was deleted";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
    System,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::File => "file",
            MessageKind::System => "system",
        }
    }

    /// `image` / `file` 必须带附件，`text` / `system` 不允许带附件。
    pub fn requires_attachment(&self) -> bool {
        matches!(self, MessageKind::Image | MessageKind::File)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageKind::Text),
            "image" => Ok(MessageKind::Image),
            "file" => Ok(MessageKind::File),
            "system" => Ok(MessageKind::System),
            other => Err(DomainError::invalid_argument(
                "message_type",
                format!("unknown kind '{other}'"),
            )),
        }
    }
}

/// 消息附件，URL 与文件名必须同时存在。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub file_url: String,
    pub file_name: String,
}

impl Attachment {
    /// 从线上的两个可选字段组装附件；只给其中一个视为参数错误。
    pub fn from_parts(
        file_url: Option<String>,
        file_name: Option<String>,
    ) -> Result<Option<Self>, DomainError> {
        let file_url = file_url.filter(|value| !value.trim().is_empty());
        let file_name = file_name.filter(|value| !value.trim().is_empty());

        match (file_url, file_name) {
            (Some(file_url), Some(file_name)) => Ok(Some(Self {
                file_url,
                file_name,
            })),
            (None, None) => Ok(None),
            _ => Err(DomainError::invalid_argument(
                "attachment",
                "file_url and file_name must be provided together",
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub room: RoomName,
    pub author_id: UserId,
    pub author_name: String,
    pub text: String,
    #[serde(rename = "message_type")]
    pub kind: MessageKind,
    #[serde(flatten)]
    pub attachment: Option<Attachment>,
    pub created_at: Timestamp,
    pub is_edited: bool,
    pub edited_at: Option<Timestamp>,
    pub deleted_at: Option<Timestamp>,
}

impl Message {
    pub fn new(
        id: MessageId,
        room: RoomName,
        author: &UserIdentity,
        text: String,
        kind: MessageKind,
        attachment: Option<Attachment>,
        created_at: Timestamp,
    ) -> Result<Self, DomainError> {
        if kind.requires_attachment() != attachment.is_some() {
            return Err(DomainError::AttachmentMismatch {
                kind: kind.to_string(),
            });
        }
        if kind == MessageKind::Text && text.trim().is_empty() {
            return Err(DomainError::EmptyMessage);
        }

        Ok(Self {
            id,
            room,
            author_id: author.user_id,
            author_name: author.display_name.clone(),
            text,
            kind,
            attachment,
            created_at,
            is_edited: false,
            edited_at: None,
            deleted_at: None,
        })
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn edit(&mut self, editor: UserId, new_text: String, at: Timestamp) -> Result<(), DomainError> {
        if self.author_id != editor {
            return Err(DomainError::NotMessageAuthor);
        }
        if self.is_deleted() {
            return Err(DomainError::MessageDeleted);
        }
        if self.kind == MessageKind::Text && new_text.trim().is_empty() {
            return Err(DomainError::EmptyMessage);
        }
        self.text = new_text;
        self.is_edited = true;
        self.edited_at = Some(at);
        Ok(())
    }

    /// 软删除：正文替换为占位文本，附件丢弃，记录删除时间。
    pub fn soft_delete(&mut self, actor: UserId, at: Timestamp) -> Result<(), DomainError> {
        if self.author_id != actor {
            return Err(DomainError::NotMessageAuthor);
        }
        if self.is_deleted() {
            return Err(DomainError::MessageDeleted);
        }
        self.text = DELETED_PLACEHOLDER.to_owned();
        self.attachment = None;
        self.deleted_at = Some(at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn author() -> UserIdentity {
        UserIdentity::new(UserId::from(Uuid::new_v4()), "alice", None)
    }

    fn room() -> RoomName {
        RoomName::parse("general").unwrap()
    }

    #[test]
    fn test_text_message_cannot_be_blank() {
        let err = Message::new(
            MessageId::new(),
            room(),
            &author(),
            "   ".into(),
            MessageKind::Text,
            None,
            Utc::now(),
        )
        .unwrap_err();
        assert_eq!(err, DomainError::EmptyMessage);
    }

    #[test]
    fn test_attachment_parts_must_come_together() {
        assert!(Attachment::from_parts(Some("/u/a.png".into()), None).is_err());
        assert!(Attachment::from_parts(None, Some("a.png".into())).is_err());
        assert_eq!(Attachment::from_parts(None, Some("  ".into())).unwrap(), None);

        let attachment = Attachment::from_parts(Some("/u/a.png".into()), Some("a.png".into()))
            .unwrap()
            .unwrap();
        assert_eq!(attachment.file_name, "a.png");
    }

    #[test]
    fn test_kind_and_attachment_must_agree() {
        let attachment = Attachment {
            file_url: "/u/a.png".into(),
            file_name: "a.png".into(),
        };
        let text_with_file = Message::new(
            MessageId::new(),
            room(),
            &author(),
            "look".into(),
            MessageKind::Text,
            Some(attachment.clone()),
            Utc::now(),
        );
        assert!(matches!(text_with_file, Err(DomainError::AttachmentMismatch { .. })));

        let image_without_file = Message::new(
            MessageId::new(),
            room(),
            &author(),
            String::new(),
            MessageKind::Image,
            None,
            Utc::now(),
        );
        assert!(image_without_file.is_err());

        let image = Message::new(
            MessageId::new(),
            room(),
            &author(),
            String::new(),
            MessageKind::Image,
            Some(attachment),
            Utc::now(),
        );
        assert!(image.is_ok());
    }

    #[test]
    fn test_only_author_can_edit_and_delete() {
        let alice = author();
        let mut message = Message::new(
            MessageId::new(),
            room(),
            &alice,
            "hello".into(),
            MessageKind::Text,
            None,
            Utc::now(),
        )
        .unwrap();

        let stranger = UserId::from(Uuid::new_v4());
        assert_eq!(
            message.edit(stranger, "hijack".into(), Utc::now()),
            Err(DomainError::NotMessageAuthor)
        );

        message.edit(alice.user_id, "hello again".into(), Utc::now()).unwrap();
        assert!(message.is_edited);
        assert_eq!(message.text, "hello again");

        message.soft_delete(alice.user_id, Utc::now()).unwrap();
        assert!(message.is_deleted());
        assert_eq!(message.text, DELETED_PLACEHOLDER);
        assert_eq!(
            message.edit(alice.user_id, "zombie".into(), Utc::now()),
            Err(DomainError::MessageDeleted)
        );
    }

    #[test]
    fn test_wire_shape_uses_flat_attachment_fields() {
        let message = Message::new(
            MessageId::new(),
            room(),
            &author(),
            String::new(),
            MessageKind::File,
            Some(Attachment {
                file_url: "/files/report.pdf".into(),
                file_name: "report.pdf".into(),
            }),
            Utc::now(),
        )
        .unwrap();

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["message_type"], "file");
        assert_eq!(json["file_name"], "report.pdf");
        assert_eq!(json["room"], "general");
    }
}
