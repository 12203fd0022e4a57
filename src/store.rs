//! Message-store readers.
//!
//! Two shapes of export carry message metadata:
//! - iMessage (`chat.db` on a Mac, `SMS/sms.db` in an iPhone backup), where
//!   every attachment row points at its file explicitly.
//! - Chat-history JSON (`json/chat_history.json`), where messages name media
//!   ids that may or may not map to a file, and messages without ids have to
//!   be paired by timestamp.

use anyhow::{Context, Result};
use chrono::{NaiveDateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{Connection, OpenFlags};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use unicode_normalization::UnicodeNormalization;

use crate::models::{
    CapturedFile, CapturedTimestamp, ConversationKind, ConversationRef, MediaKind, MediaRef, MessageText,
    RawMessage,
};
use crate::scan::BannedFilter;

/// Seconds between 1970-01-01 and 2001-01-01.
pub const APPLE_EPOCH_OFFSET: i64 = 978_307_200;

/// iMessage chat style for group conversations.
const GROUP_CHAT_STYLE: i64 = 43;

/// Attachment transfer finished.
const TRANSFER_COMPLETE: i64 = 5;

static UUID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$").unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    /// `chat.db` at the export root
    MacMessages,
    /// `SMS/sms.db` under the export root
    IphoneBackup,
    /// `json/chat_history.json`
    ChatHistory,
    /// No message store; media only
    MediaOnly,
}

impl ExportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ExportKind::MacMessages => "mac",
            ExportKind::IphoneBackup => "iphone",
            ExportKind::ChatHistory => "chat_history",
            ExportKind::MediaOnly => "media_only",
        }
    }
}

pub fn detect_export(root: &Path) -> ExportKind {
    if root.join("chat.db").is_file() {
        ExportKind::MacMessages
    } else if root.join("SMS").join("sms.db").is_file() {
        ExportKind::IphoneBackup
    } else if chat_history_path(root).is_file() {
        ExportKind::ChatHistory
    } else {
        ExportKind::MediaOnly
    }
}

pub fn chat_history_path(root: &Path) -> PathBuf {
    root.join("json").join("chat_history.json")
}

/// NFC-normalized path string. macOS exports store decomposed names.
pub fn nfc_key(path: &Path) -> String {
    path.to_string_lossy().nfc().collect()
}

/// Convert an Apple Cocoa timestamp. Modern stores use nanoseconds since
/// 2001-01-01; older ones use seconds. Zero and negative values mean unknown.
pub fn apple_timestamp(raw: i64) -> Option<CapturedTimestamp> {
    if raw <= 0 {
        return None;
    }
    // Seconds-based values stay far below this for any plausible date
    let (secs, nanos) = if raw > 100_000_000_000 {
        (raw / 1_000_000_000, (raw % 1_000_000_000) as u32)
    } else {
        (raw, 0)
    };
    let dt = Utc.timestamp_opt(secs.checked_add(APPLE_EPOCH_OFFSET)?, nanos).single()?;
    Some(CapturedTimestamp::from_recorded(dt))
}

/// Map a `~/Library/...` attachment path from the database into the export.
/// Returns `None` when the file is not present.
pub fn resolve_attachment_path(root: &Path, kind: ExportKind, db_path: &str) -> Option<PathBuf> {
    if db_path.is_empty() {
        return None;
    }
    let resolved = match kind {
        ExportKind::MacMessages => root.join(db_path.trim_start_matches("~/Library/Messages/")),
        ExportKind::IphoneBackup => root.join("SMS").join(db_path.trim_start_matches("~/Library/SMS/")),
        _ => return None,
    };
    if resolved.is_file() {
        return Some(resolved);
    }
    // Decomposed vs composed names
    let composed: String = resolved.to_string_lossy().nfc().collect();
    let composed = PathBuf::from(composed);
    composed.is_file().then_some(composed)
}

// ============================================================================
// iMessage
// ============================================================================

const ATTACHMENT_QUERY: &str = "
    SELECT
        a.ROWID,
        a.filename,
        a.transfer_name,
        m.ROWID,
        m.text,
        m.attributedBody,
        m.date,
        m.is_from_me,
        c.display_name,
        c.chat_identifier,
        c.style,
        h.id
    FROM attachment a
    JOIN message_attachment_join maj ON a.ROWID = maj.attachment_id
    JOIN message m ON maj.message_id = m.ROWID
    JOIN chat_message_join cmj ON m.ROWID = cmj.message_id
    JOIN chat c ON cmj.chat_id = c.ROWID
    LEFT JOIN handle h ON m.handle_id = h.ROWID
    WHERE a.filename IS NOT NULL
      AND a.transfer_state = ?1
    ORDER BY m.date, m.ROWID, a.ROWID";

pub struct ImessageStore {
    conn: Connection,
    root: PathBuf,
    kind: ExportKind,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StoreStats {
    pub attachment_rows: usize,
    pub missing_files: usize,
    pub banned: usize,
    pub non_media: usize,
    pub live_photos: usize,
}

impl ImessageStore {
    pub fn open(root: &Path) -> Result<Self> {
        let kind = detect_export(root);
        let db_path = match kind {
            ExportKind::MacMessages => root.join("chat.db"),
            ExportKind::IphoneBackup => root.join("SMS").join("sms.db"),
            _ => anyhow::bail!("No iMessage database in {}", root.display()),
        };
        let conn = Connection::open_with_flags(
            &db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("Failed to open {}", db_path.display()))?;
        Ok(Self {
            conn,
            root: root.to_path_buf(),
            kind,
        })
    }

    pub fn kind(&self) -> ExportKind {
        self.kind
    }

    /// One `RawMessage` per message with at least one attachment, in message
    /// date order. Attachments whose file is missing from the export are kept
    /// as unresolved references.
    pub fn read_messages(&self, filter: &BannedFilter) -> Result<(Vec<RawMessage>, StoreStats)> {
        let mut stmt = self.conn.prepare(ATTACHMENT_QUERY)?;
        let mut rows = stmt.query([TRANSFER_COMPLETE])?;

        let mut stats = StoreStats::default();
        let mut messages: Vec<RawMessage> = Vec::new();
        let mut by_rowid: FxHashMap<i64, usize> = FxHashMap::default();

        while let Some(row) = rows.next()? {
            stats.attachment_rows += 1;
            let filename: String = row.get(1)?;
            let transfer_name: Option<String> = row.get(2)?;
            let message_rowid: i64 = row.get(3)?;

            let resolved = resolve_attachment_path(&self.root, self.kind, &filename);
            if let Some(path) = &resolved {
                if filter.is_banned(path) {
                    stats.banned += 1;
                    continue;
                }
                if MediaKind::from_path(path).is_none() {
                    stats.non_media += 1;
                    continue;
                }
            } else {
                if MediaKind::from_path(Path::new(&filename)).is_none() {
                    stats.non_media += 1;
                    continue;
                }
                stats.missing_files += 1;
            }

            let idx = match by_rowid.get(&message_rowid) {
                Some(&idx) => idx,
                None => {
                    let text: Option<String> = row.get(4)?;
                    let blob: Option<Vec<u8>> = row.get(5)?;
                    let date: Option<i64> = row.get(6)?;
                    let is_from_me: i64 = row.get::<_, Option<i64>>(7)?.unwrap_or(0);
                    let display_name: Option<String> = row.get(8)?;
                    let chat_identifier: Option<String> = row.get(9)?;
                    let style: i64 = row.get::<_, Option<i64>>(10)?.unwrap_or(45);
                    let handle: Option<String> = row.get(11)?;

                    let chat_id = chat_identifier.unwrap_or_default();
                    let title = display_name.filter(|s| !s.is_empty()).or_else(|| Some(chat_id.clone()));
                    let sender = if is_from_me != 0 {
                        "me".to_string()
                    } else {
                        handle.unwrap_or_else(|| "unknown".to_string())
                    };

                    messages.push(RawMessage {
                        id: message_rowid.to_string(),
                        sender,
                        is_from_me: is_from_me != 0,
                        conversation: ConversationRef {
                            id: chat_id,
                            title,
                            kind: if style == GROUP_CHAT_STYLE {
                                ConversationKind::Group
                            } else {
                                ConversationKind::Dm
                            },
                        },
                        timestamp: date.and_then(apple_timestamp),
                        text: MessageText { plain: text, blob },
                        media_refs: Vec::new(),
                        expects_media: true,
                    });
                    by_rowid.insert(message_rowid, messages.len() - 1);
                    messages.len() - 1
                }
            };

            let message = &mut messages[idx];
            message.media_refs.push(MediaRef {
                id: filename.clone(),
                path: resolved.clone(),
            });

            // Live Photo: the motion half sits next to the still
            if transfer_name.as_deref() == Some("lp_image.HEIC") {
                if let Some(mov) = resolved
                    .as_deref()
                    .and_then(Path::parent)
                    .map(|p| p.join("lp_image.MOV"))
                    .filter(|p| p.is_file())
                {
                    stats.live_photos += 1;
                    message.media_refs.push(MediaRef {
                        id: format!("{}#live", filename),
                        path: Some(mov),
                    });
                }
            }
        }

        Ok((messages, stats))
    }
}

// ============================================================================
// Chat-history JSON
// ============================================================================

#[derive(Debug, Deserialize)]
struct ChatHistoryMessage {
    #[serde(rename = "From", default)]
    from: String,
    #[serde(rename = "Media Type", default)]
    media_type: String,
    #[serde(rename = "Created", default)]
    created: String,
    #[serde(rename = "Content", default)]
    content: Option<String>,
    #[serde(rename = "IsSender", default)]
    is_sender: bool,
    #[serde(rename = "Media IDs", default)]
    media_ids: String,
    #[serde(rename = "Conversation Title", default)]
    conversation_title: Option<String>,
}

/// `YYYY-MM-DD HH:MM:SS UTC`
pub fn parse_export_timestamp(s: &str) -> Option<CapturedTimestamp> {
    let trimmed = s.trim().trim_end_matches("UTC").trim();
    let naive = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S").ok()?;
    Some(CapturedTimestamp::from_recorded(naive.and_utc()))
}

/// Media id embedded in a chat-media filename: everything after the first `_`
/// of the stem (`2024-01-01_b~abc.jpg` yields `b~abc`).
fn media_id_of(file: &CapturedFile) -> Option<String> {
    let stem = file.path().file_stem()?.to_str()?;
    let (_, id) = stem.split_once('_')?;
    (!id.is_empty()).then(|| id.nfc().collect())
}

/// Load `json/chat_history.json`. `media` is the scanned media of the same
/// export, used to resolve media ids to files.
pub fn load_chat_history(path: &Path, media: &[CapturedFile]) -> Result<Vec<RawMessage>> {
    let raw = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let history: BTreeMap<String, Vec<ChatHistoryMessage>> =
        serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))?;

    let mut by_id: FxHashMap<String, PathBuf> = FxHashMap::default();
    for file in media {
        if let Some(id) = media_id_of(file) {
            by_id.entry(id).or_insert_with(|| file.path().to_path_buf());
        }
    }

    let mut messages = Vec::new();
    for (conversation_id, entries) in history {
        let title = entries.iter().find_map(|m| m.conversation_title.clone());
        let kind = if title.is_some() || UUID_PATTERN.is_match(&conversation_id) {
            ConversationKind::Group
        } else {
            ConversationKind::Dm
        };

        for (i, entry) in entries.into_iter().enumerate() {
            if entry.media_type == "TEXT" {
                continue;
            }
            let media_refs: Vec<MediaRef> = entry
                .media_ids
                .split('|')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(|id| {
                    let key: String = id.nfc().collect();
                    MediaRef {
                        id: id.to_string(),
                        path: by_id.get(&key).cloned(),
                    }
                })
                .collect();

            messages.push(RawMessage {
                id: format!("{}#{}", conversation_id, i),
                sender: entry.from,
                is_from_me: entry.is_sender,
                conversation: ConversationRef {
                    id: conversation_id.clone(),
                    title: title.clone(),
                    kind,
                },
                timestamp: parse_export_timestamp(&entry.created),
                text: MessageText {
                    plain: entry.content.filter(|c| !c.is_empty()),
                    blob: None,
                },
                media_refs,
                expects_media: true,
            });
        }
    }

    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typedstream::tests::encode;
    use crate::typedstream::LengthPrefix;
    use rusqlite::params;

    #[test]
    fn test_apple_timestamp_nanoseconds_and_seconds() {
        // 2023-11-14 22:13:20 UTC
        let secs = 1_700_000_000 - APPLE_EPOCH_OFFSET;
        let ns = apple_timestamp(secs * 1_000_000_000 + 250_000_000).unwrap();
        assert_eq!(ns.epoch_secs(), 1_700_000_000);
        assert_eq!(ns.subsec_nanos(), 250_000_000);
        let legacy = apple_timestamp(secs).unwrap();
        assert_eq!(legacy.epoch_secs(), 1_700_000_000);
        assert!(apple_timestamp(0).is_none());
        assert!(apple_timestamp(-5).is_none());
    }

    #[test]
    fn test_parse_export_timestamp() {
        let ts = parse_export_timestamp("2023-11-14 22:13:20 UTC").unwrap();
        assert_eq!(ts.epoch_secs(), 1_700_000_000);
        assert!(parse_export_timestamp("yesterday").is_none());
    }

    fn create_chat_db(root: &Path) -> Connection {
        let conn = Connection::open(root.join("chat.db")).unwrap();
        conn.execute_batch(
            "CREATE TABLE attachment (ROWID INTEGER PRIMARY KEY, filename TEXT, transfer_name TEXT, transfer_state INTEGER);
             CREATE TABLE message (ROWID INTEGER PRIMARY KEY, text TEXT, attributedBody BLOB, date INTEGER, is_from_me INTEGER, handle_id INTEGER);
             CREATE TABLE message_attachment_join (message_id INTEGER, attachment_id INTEGER);
             CREATE TABLE chat (ROWID INTEGER PRIMARY KEY, display_name TEXT, chat_identifier TEXT, style INTEGER);
             CREATE TABLE chat_message_join (chat_id INTEGER, message_id INTEGER);
             CREATE TABLE handle (ROWID INTEGER PRIMARY KEY, id TEXT);",
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_read_imessage_store() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let att = root.join("Attachments").join("ab").join("01");
        fs::create_dir_all(&att).unwrap();
        fs::write(att.join("lp_image.HEIC"), b"still").unwrap();
        fs::write(att.join("lp_image.MOV"), b"motion").unwrap();
        fs::write(att.join("doc.pdf"), b"pdf").unwrap();

        let conn = create_chat_db(root);
        let blob = encode(b"look at this", LengthPrefix::Direct(12), &[]);
        conn.execute_batch(
            "INSERT INTO chat VALUES (1, 'Family', 'chat123', 43);
             INSERT INTO chat VALUES (2, '', '+15550001', 45);
             INSERT INTO handle VALUES (1, '+15550001');",
        )
        .unwrap();
        let date = (1_700_000_000 - APPLE_EPOCH_OFFSET) * 1_000_000_000;
        conn.execute(
            "INSERT INTO message VALUES (10, NULL, ?1, ?2, 0, 1)",
            params![blob, date],
        )
        .unwrap();
        conn.execute("INSERT INTO message VALUES (11, 'sent', NULL, ?1, 1, 0)", params![date + 5])
            .unwrap();
        conn.execute_batch(
            "INSERT INTO attachment VALUES (1, '~/Library/Messages/Attachments/ab/01/lp_image.HEIC', 'lp_image.HEIC', 5);
             INSERT INTO attachment VALUES (2, '~/Library/Messages/Attachments/ab/01/doc.pdf', 'doc.pdf', 5);
             INSERT INTO attachment VALUES (3, '~/Library/Messages/Attachments/zz/gone.jpg', 'gone.jpg', 5);
             INSERT INTO attachment VALUES (4, '~/Library/Messages/Attachments/zz/pending.jpg', 'pending.jpg', 0);
             INSERT INTO message_attachment_join VALUES (10, 1), (10, 2), (11, 3), (11, 4);
             INSERT INTO chat_message_join VALUES (1, 10), (2, 11);",
        )
        .unwrap();
        drop(conn);

        assert_eq!(detect_export(root), ExportKind::MacMessages);
        let store = ImessageStore::open(root).unwrap();
        let (messages, stats) = store.read_messages(&BannedFilter::default()).unwrap();

        assert_eq!(messages.len(), 2);
        assert_eq!(stats.non_media, 1);
        assert_eq!(stats.live_photos, 1);
        assert_eq!(stats.missing_files, 1);

        let group = &messages[0];
        assert_eq!(group.id, "10");
        assert_eq!(group.sender, "+15550001");
        assert_eq!(group.conversation.kind, ConversationKind::Group);
        assert_eq!(group.conversation.title.as_deref(), Some("Family"));
        assert_eq!(group.timestamp.unwrap().epoch_secs(), 1_700_000_000);
        assert!(group.text.blob.is_some());
        assert_eq!(group.media_refs.len(), 2);
        assert!(group.media_refs[1].path.as_ref().unwrap().ends_with("lp_image.MOV"));

        let dm = &messages[1];
        assert_eq!(dm.sender, "me");
        assert_eq!(dm.conversation.kind, ConversationKind::Dm);
        assert_eq!(dm.conversation.title.as_deref(), Some("+15550001"));
        assert_eq!(dm.media_refs.len(), 1);
        assert!(dm.media_refs[0].path.is_none());
    }

    #[test]
    fn test_iphone_path_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let att = root.join("SMS").join("Attachments").join("0a");
        fs::create_dir_all(&att).unwrap();
        fs::write(att.join("IMG.jpg"), b"x").unwrap();
        let resolved = resolve_attachment_path(
            root,
            ExportKind::IphoneBackup,
            "~/Library/SMS/Attachments/0a/IMG.jpg",
        );
        assert_eq!(resolved, Some(att.join("IMG.jpg")));
        assert!(resolve_attachment_path(root, ExportKind::IphoneBackup, "~/Library/SMS/nope.jpg").is_none());
    }

    #[test]
    fn test_load_chat_history() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let media_dir = root.join("chat_media");
        fs::create_dir_all(&media_dir).unwrap();
        fs::write(media_dir.join("2023-11-14_b~AAA.jpg"), b"a").unwrap();
        let media = vec![CapturedFile::capture(&media_dir.join("2023-11-14_b~AAA.jpg")).unwrap()];

        let json = r#"{
            "alice": [
                {"From": "alice", "Media Type": "TEXT", "Created": "2023-11-14 22:13:20 UTC", "Content": "hi", "IsSender": false, "Media IDs": ""},
                {"From": "alice", "Media Type": "IMAGE", "Created": "2023-11-14 22:13:20 UTC", "Content": "", "IsSender": false, "Media IDs": "b~AAA | b~BBB"}
            ],
            "0f8fad5b-d9cb-469f-a165-70867728950e": [
                {"From": "me", "Media Type": "VIDEO", "Created": "2023-11-14 22:15:00 UTC", "IsSender": true}
            ]
        }"#;
        let path = chat_history_path(root);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, json).unwrap();
        assert_eq!(detect_export(root), ExportKind::ChatHistory);

        let messages = load_chat_history(&path, &media).unwrap();
        assert_eq!(messages.len(), 2);

        let group = &messages[0];
        assert_eq!(group.conversation.kind, ConversationKind::Group);
        assert!(group.needs_fuzzy_match());

        let dm = &messages[1];
        assert_eq!(dm.conversation.kind, ConversationKind::Dm);
        assert_eq!(dm.media_refs.len(), 2);
        assert!(dm.media_refs[0].path.is_some());
        assert!(dm.media_refs[1].path.is_none());
        assert!(dm.text.plain.is_none());
    }
}
