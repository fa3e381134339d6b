use mailparse::ParsedMail;

/// Best-effort plain text from a raw RFC822 message.
///
/// Prefers a text/plain part, converts text/html when that is all the
/// message carries, and degrades to a lossy decode of the input for
/// anything unparseable. Never fails and never panics.
pub fn to_plain_text(raw: &[u8]) -> String {
    match mailparse::parse_mail(raw) {
        Ok(parsed) => {
            if let Some(text) = find_part(&parsed, "text/plain") {
                return text;
            }
            if let Some(html) = find_part(&parsed, "text/html") {
                return nanohtml2text::html2text(&html);
            }
            parsed
                .get_body()
                .unwrap_or_else(|_| String::from_utf8_lossy(raw).into_owned())
        }
        Err(_) => String::from_utf8_lossy(raw).into_owned(),
    }
}

// Depth-first search for the first part of the wanted content type
fn find_part(part: &ParsedMail<'_>, content_type: &str) -> Option<String> {
    if part.ctype.mimetype.eq_ignore_ascii_case(content_type) {
        return part.get_body().ok();
    }
    part.subparts
        .iter()
        .find_map(|subpart| find_part(subpart, content_type))
}
