use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, FixedOffset};
use mailparse::{MailAddr, MailHeaderMap, ParsedMail};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAttachment {
    pub filename: Option<String>,
    pub content_type: String,
    pub payload: Vec<u8>,
}

/// RFC 822 message decoded into the fields the archive stores.
#[derive(Debug, Clone, Default)]
pub struct ParsedMessage {
    pub uid: u32,
    pub subject: String,
    pub from: Vec<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub date: Option<DateTime<FixedOffset>>,
    pub text: String,
    pub html: String,
    pub attachments: Vec<ParsedAttachment>,
    pub headers: Vec<(String, String)>,
    pub message_id: String,
}

impl ParsedMessage {
    pub fn parse(uid: u32, raw: &[u8]) -> Result<Self> {
        let parsed = mailparse::parse_mail(raw)
            .with_context(|| format!("failed to parse message uid {}", uid))?;

        let headers = parsed
            .headers
            .iter()
            .map(|h| (h.get_key(), h.get_value()))
            .collect::<Vec<_>>();

        let mut message = ParsedMessage {
            uid,
            subject: parsed
                .headers
                .get_first_value("Subject")
                .unwrap_or_default()
                .trim()
                .to_string(),
            from: address_header(&parsed, "From"),
            to: address_header(&parsed, "To"),
            cc: address_header(&parsed, "Cc"),
            bcc: address_header(&parsed, "Bcc"),
            date: parsed
                .headers
                .get_first_value("Date")
                .and_then(|value| parse_date(&value)),
            message_id: parsed
                .headers
                .get_first_value("Message-ID")
                .map(|value| value.trim().to_string())
                .unwrap_or_default(),
            headers,
            ..Default::default()
        };

        collect_parts(&parsed, &mut message)?;
        Ok(message)
    }

    /// RFC 3339 rendering of the date, empty when the message has none.
    pub fn date_rfc3339(&self) -> String {
        self.date.map(|d| d.to_rfc3339()).unwrap_or_default()
    }

    pub fn year_month(&self) -> Option<(i32, u32)> {
        self.date.map(|d| (d.year(), d.month()))
    }

    pub fn sender(&self) -> String {
        self.from.first().cloned().unwrap_or_default()
    }
}

/// Message-ID from a header-only fetch.
pub fn message_id_from_headers(raw: &[u8]) -> String {
    header_value(raw, "Message-ID")
        .map(|value| value.trim().to_string())
        .unwrap_or_default()
}

/// Date header from a header-only fetch.
pub fn date_from_headers(raw: &[u8]) -> Option<DateTime<FixedOffset>> {
    header_value(raw, "Date").and_then(|value| parse_date(&value))
}

pub fn header_value(raw: &[u8], name: &str) -> Option<String> {
    let (headers, _) = mailparse::parse_headers(raw).ok()?;
    for header in headers.iter() {
        if header.get_key_ref().eq_ignore_ascii_case(name) {
            return Some(header.get_value());
        }
    }
    None
}

fn parse_date(value: &str) -> Option<DateTime<FixedOffset>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(date) = DateTime::parse_from_rfc2822(trimmed) {
        return Some(date);
    }
    let epoch = mailparse::dateparse(trimmed).ok()?;
    DateTime::from_timestamp(epoch, 0).map(|d| d.fixed_offset())
}

fn address_header(parsed: &ParsedMail, name: &str) -> Vec<String> {
    let Some(header) = parsed.headers.get_first_header(name) else {
        return Vec::new();
    };
    match mailparse::addrparse_header(header) {
        Ok(list) => mailaddrs_to_emails(&list),
        Err(_) => fallback_addresses(&header.get_value()),
    }
}

/// Salvages an unparseable address list. Display names may hold commas, so
/// only the `<...>` parts are kept when there are any.
fn fallback_addresses(raw: &str) -> Vec<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Vec::new();
    }
    if !raw.contains('<') {
        return vec![raw.to_string()];
    }
    let mut out = Vec::new();
    let mut rest = raw;
    while let Some(start) = rest.find('<') {
        let tail = &rest[start + 1..];
        let Some(end) = tail.find('>') else {
            break;
        };
        let addr = tail[..end].trim();
        if !addr.is_empty() {
            out.push(addr.to_string());
        }
        rest = &tail[end + 1..];
    }
    out
}

fn mailaddrs_to_emails(addrs: &[MailAddr]) -> Vec<String> {
    let mut out = Vec::new();
    for addr in addrs {
        match addr {
            MailAddr::Single(info) => out.push(info.addr.clone()),
            MailAddr::Group(group) => {
                out.extend(group.addrs.iter().map(|info| info.addr.clone()));
            }
        }
    }
    out.retain(|addr| !addr.trim().is_empty());
    out
}

fn collect_parts(parsed: &ParsedMail, message: &mut ParsedMessage) -> Result<()> {
    if !parsed.subparts.is_empty() {
        for part in &parsed.subparts {
            collect_parts(part, message)?;
        }
        return Ok(());
    }

    let ctype = parsed.ctype.mimetype.to_lowercase();
    let disposition = parsed.get_content_disposition();
    let filename = disposition
        .params
        .get("filename")
        .cloned()
        .or_else(|| parsed.ctype.params.get("name").cloned())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty());

    let is_attachment = matches!(
        disposition.disposition,
        mailparse::DispositionType::Attachment
    ) || filename.is_some();

    if is_attachment {
        message.attachments.push(ParsedAttachment {
            filename,
            content_type: ctype,
            payload: parsed.get_body_raw()?,
        });
        return Ok(());
    }

    if ctype == "text/plain" && message.text.is_empty() {
        message.text = parsed.get_body()?;
    } else if ctype == "text/html" && message.html.is_empty() {
        message.html = parsed.get_body()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Datelike;

    use super::{ParsedMessage, date_from_headers, fallback_addresses, message_id_from_headers};

    const SIMPLE: &[u8] = b"From: \"Boss\" <Boss@Corp.com>\r\n\
To: me@home.org, \"Other\" <other@home.org>\r\n\
Cc: team: a@corp.com, b@corp.com;\r\n\
Subject: Quarterly numbers\r\n\
Date: Tue, 14 Mar 2023 09:30:00 +0100\r\n\
Message-ID: <abc123@corp.com>\r\n\
\r\n\
See attached.\r\n";

    const MULTIPART: &[u8] = b"From: sender@ex.com\r\n\
To: me@home.org\r\n\
Subject: Report\r\n\
Date: Fri, 02 Feb 2024 12:00:00 +0000\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"XX\"\r\n\
\r\n\
--XX\r\n\
Content-Type: multipart/alternative; boundary=\"YY\"\r\n\
\r\n\
--YY\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
plain body\r\n\
--YY\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<p>html body</p>\r\n\
--YY--\r\n\
--XX\r\n\
Content-Type: text/plain; name=\"notes.txt\"\r\n\
Content-Disposition: attachment; filename=\"notes.txt\"\r\n\
\r\n\
attached notes\r\n\
--XX\r\n\
Content-Type: application/pdf\r\n\
Content-Disposition: attachment\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
JVBERi0=\r\n\
--XX--\r\n";

    #[test]
    fn parses_headers_and_addresses() -> anyhow::Result<()> {
        let message = ParsedMessage::parse(42, SIMPLE)?;
        assert_eq!(message.uid, 42);
        assert_eq!(message.subject, "Quarterly numbers");
        assert_eq!(message.sender(), "Boss@Corp.com");
        assert_eq!(message.to, vec!["me@home.org", "other@home.org"]);
        assert_eq!(message.cc, vec!["a@corp.com", "b@corp.com"]);
        assert!(message.bcc.is_empty());
        assert_eq!(message.message_id, "<abc123@corp.com>");
        assert_eq!(message.date_rfc3339(), "2023-03-14T09:30:00+01:00");
        assert_eq!(message.year_month(), Some((2023, 3)));
        assert!(message.text.starts_with("See attached."));
        assert!(message.attachments.is_empty());
        Ok(())
    }

    #[test]
    fn splits_bodies_from_attachments() -> anyhow::Result<()> {
        let message = ParsedMessage::parse(7, MULTIPART)?;
        assert!(message.text.starts_with("plain body"));
        assert!(message.html.contains("<p>html body</p>"));
        assert_eq!(message.attachments.len(), 2);
        assert_eq!(message.attachments[0].filename.as_deref(), Some("notes.txt"));
        assert_eq!(message.attachments[0].content_type, "text/plain");
        assert!(message.attachments[0].payload.starts_with(b"attached notes"));
        assert_eq!(message.attachments[1].filename, None);
        assert_eq!(message.attachments[1].content_type, "application/pdf");
        assert_eq!(message.attachments[1].payload, b"%PDF-");
        Ok(())
    }

    #[test]
    fn missing_date_leaves_fields_empty() -> anyhow::Result<()> {
        let message = ParsedMessage::parse(1, b"Subject: no date\r\n\r\nbody\r\n")?;
        assert_eq!(message.date, None);
        assert_eq!(message.date_rfc3339(), "");
        assert_eq!(message.year_month(), None);
        assert_eq!(message.sender(), "");
        assert_eq!(message.message_id, "");
        Ok(())
    }

    #[test]
    fn unparseable_address_lists_keep_bracketed_addresses() {
        assert_eq!(
            fallback_addresses("\"Doe, John\" <j@x.com>, Smith, Ann <ann@y.org>"),
            vec!["j@x.com", "ann@y.org"]
        );
        assert_eq!(fallback_addresses("<a@b.c>, <unterminated@d.e"), vec!["a@b.c"]);
        assert_eq!(fallback_addresses("plain@host.org"), vec!["plain@host.org"]);
        assert!(fallback_addresses("   ").is_empty());
    }

    #[test]
    fn message_id_comes_from_header_only_fetch() {
        let headers = b"Subject: x\r\nmessage-id:   <id@host>  \r\n\r\n";
        assert_eq!(message_id_from_headers(headers), "<id@host>");
        assert_eq!(message_id_from_headers(b"Subject: x\r\n\r\n"), "");
    }

    #[test]
    fn header_dates_fall_back_to_lenient_parsing() {
        let strict = date_from_headers(b"Date: Sun, 05 May 2019 07:08:09 +0200\r\n\r\n");
        assert_eq!(strict.map(|d| d.year()), Some(2019));
        let lenient = date_from_headers(b"Date: 5 May 2019 07:08:09 GMT\r\n\r\n");
        assert_eq!(lenient.map(|d| d.year()), Some(2019));
        assert_eq!(date_from_headers(b"Date: sometime\r\n\r\n"), None);
    }
}
