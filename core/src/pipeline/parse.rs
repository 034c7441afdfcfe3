//! MIME parsing and cleanup stages

use async_trait::async_trait;
use mailparse::{MailAddr, MailHeaderMap, ParsedMail};
use regex::Regex;
use time::OffsetDateTime;

use crate::error::HeimdallResult;
use crate::message::{MessageDraft, Participant};

use super::{reject, PipelineStage};

const SNIPPET_LENGTH: usize = 100;

/// Parse the raw RFC 2822 bytes into headers, participants, body and snippet
pub struct ParseStage;

fn find_part<'a>(part: &'a ParsedMail<'a>, mimetype: &str) -> Option<&'a ParsedMail<'a>> {
    if part.ctype.mimetype.eq_ignore_ascii_case(mimetype) {
        return Some(part);
    }
    part.subparts.iter().find_map(|sub| find_part(sub, mimetype))
}

fn parse_participants(raw: Option<String>) -> HeimdallResult<Vec<Participant>> {
    let raw = match raw {
        Some(value) if !value.trim().is_empty() => value,
        _ => return Ok(Vec::new()),
    };
    let mut participants = Vec::new();
    for addr in mailparse::addrparse(&raw)?.iter() {
        match addr {
            MailAddr::Single(info) => {
                participants.push(Participant::new(info.display_name.as_deref(), &info.addr));
            }
            MailAddr::Group(group) => {
                for info in &group.addrs {
                    participants.push(Participant::new(info.display_name.as_deref(), &info.addr));
                }
            }
        }
    }
    Ok(participants)
}

fn strip_html(body: &str) -> String {
    let re = Regex::new(r"<[^>]*>").unwrap();
    re.replace_all(body, " ").into_owned()
}

fn snippet_of(body: &str) -> String {
    let collapsed = body.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(SNIPPET_LENGTH).collect()
}

#[async_trait]
impl PipelineStage for ParseStage {
    fn name(&self) -> &'static str {
        "parse"
    }

    async fn apply(&self, mut draft: MessageDraft) -> HeimdallResult<MessageDraft> {
        let parsed = mailparse::parse_mail(&draft.raw)?;
        let headers = &parsed.headers;

        draft.subject = headers.get_first_value("Subject").unwrap_or_default();
        draft.header_message_id = headers.get_first_value("Message-ID");
        draft.in_reply_to = headers.get_first_value("In-Reply-To");
        draft.references = headers
            .get_first_value("References")
            .map(|refs| refs.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        if draft.remote_thread_id.is_none() {
            draft.remote_thread_id = headers.get_first_value("X-GM-THRID");
        }

        if let Some(date) = headers.get_first_value("Date") {
            if let Ok(stamp) = mailparse::dateparse(&date) {
                draft.date = OffsetDateTime::from_unix_timestamp(stamp)
                    .unwrap_or_else(|_| OffsetDateTime::now_utc());
            }
        }

        draft.from = parse_participants(headers.get_first_value("From"))?;
        draft.to = parse_participants(headers.get_first_value("To"))?;
        draft.cc = parse_participants(headers.get_first_value("Cc"))?;
        draft.bcc = parse_participants(headers.get_first_value("Bcc"))?;

        // Prefer a plain part; fall back to stripped HTML.
        if let Some(plain) = find_part(&parsed, "text/plain") {
            draft.body = plain.get_body()?;
            draft.snippet = snippet_of(&draft.body);
        } else if let Some(html) = find_part(&parsed, "text/html") {
            draft.body = html.get_body()?;
            draft.snippet = snippet_of(&strip_html(&draft.body));
        } else {
            return Err(reject("no text part in message"));
        }

        Ok(draft)
    }
}

/// Normalize whitespace so downstream matching sees tidy values
pub struct HygieneStage;

#[async_trait]
impl PipelineStage for HygieneStage {
    fn name(&self) -> &'static str {
        "hygiene"
    }

    async fn apply(&self, mut draft: MessageDraft) -> HeimdallResult<MessageDraft> {
        draft.subject = draft.subject.split_whitespace().collect::<Vec<_>>().join(" ");
        draft.body = draft.body.trim_end().to_string();
        Ok(draft)
    }
}
