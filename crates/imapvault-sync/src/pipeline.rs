use anyhow::anyhow;
use imapvault_core::{AttachmentRecord, DownloadedMessage, MessageParticipants, RecipientInput};
use imapvault_mail::{ParsedMessage, RawMessage};
use tracing::{debug, info};

use crate::{Engine, SyncError, SyncResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Stored,
    AlreadyPresent,
}

/// Parses one fetched message, writes its attachments, links its
/// participants and finally inserts the raw record. The raw record goes
/// last so that its presence means the message was processed completely.
///
/// Problems with what the server sent are `Mail` errors; local database and
/// disk failures are `Store` errors.
pub async fn persist_message(
    engine: &Engine<'_>,
    folder: &str,
    raw: &RawMessage,
) -> SyncResult<MessageOutcome> {
    let uid = raw.uid;
    if engine
        .store
        .exists(uid, folder)
        .await
        .map_err(SyncError::Store)?
    {
        return Ok(MessageOutcome::AlreadyPresent);
    }
    let body = raw
        .body
        .as_deref()
        .ok_or_else(|| SyncError::Mail(anyhow!("no body returned for uid {}", uid)))?;
    let parsed = ParsedMessage::parse(uid, body).map_err(SyncError::Mail)?;
    info!(uid, folder, date = %parsed.date_rfc3339(), subject = %parsed.subject, "downloading message");

    let stored = engine
        .layout
        .store(
            folder,
            parsed.year_month(),
            uid,
            &parsed.attachments,
            engine.extractor,
        )
        .map_err(SyncError::Store)?;
    let attachment_dir = stored
        .as_ref()
        .map(|(dir, _)| dir.to_string_lossy().into_owned());

    let record = DownloadedMessage {
        uid,
        folder: folder.to_string(),
        subject: parsed.subject.clone(),
        sender: parsed.sender(),
        recipients: parsed.to.join(", "),
        cc: parsed.cc.join(", "),
        bcc: parsed.bcc.join(", "),
        date: parsed.date_rfc3339(),
        body_text: parsed.text.clone(),
        body_html: parsed.html.clone(),
        attachment_dir,
        message_id: parsed.message_id.clone(),
    };

    if let Some((_, attachments)) = &stored {
        for attachment in attachments {
            engine
                .store
                .insert_attachment(&AttachmentRecord {
                    uid,
                    folder: folder.to_string(),
                    filename: attachment.filename.clone(),
                    content_type: attachment.content_type.clone(),
                    path: attachment.path.to_string_lossy().into_owned(),
                    size: attachment.size,
                    extracted_text: attachment.extracted_text.clone(),
                })
                .await
                .map_err(SyncError::Store)?;
        }
    }

    let participants = MessageParticipants::from_inputs(
        &record.sender,
        RecipientInput::List(&parsed.to),
        RecipientInput::List(&parsed.cc),
        RecipientInput::List(&parsed.bcc),
    );
    let message_pk = engine
        .store
        .normalize(&record, &participants)
        .await
        .map_err(SyncError::Store)?;
    let inserted = engine
        .store
        .insert_if_absent(&record)
        .await
        .map_err(SyncError::Store)?;
    debug!(uid, folder, message_pk, inserted, "message persisted");
    Ok(if inserted {
        MessageOutcome::Stored
    } else {
        MessageOutcome::AlreadyPresent
    })
}
