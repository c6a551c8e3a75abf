use url::Url;
use urlencoding::{decode, encode};

/// A parsed invitation: the room to rendezvous on.
#[derive(Debug, Clone)]
pub struct InviteLink {
    pub room_id: String,
}

pub fn build_invite_url(room_id: &str) -> String {
    format!("huddle://join?room={}", encode(room_id))
}

/// Accepts `huddle://` invites, plain http(s) links carrying a `room`
/// query parameter, or a bare query string. `None` means "no room named
/// here", in which case the caller creates a fresh room instead.
pub fn parse_invite_url(input: &str) -> Option<InviteLink> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    let normalized = if trimmed.starts_with("huddle://")
        || trimmed.starts_with("http://")
        || trimmed.starts_with("https://")
    {
        trimmed.to_string()
    } else {
        format!("huddle://join?{}", trimmed)
    };

    let url = Url::parse(&normalized).ok()?;
    let mut room_id = None;
    for (key, value) in url.query_pairs() {
        if key.as_ref() == "room" {
            room_id = decode(&value).ok().map(|v| v.into_owned());
        }
    }

    let room_id = room_id.filter(|id| !id.is_empty())?;
    Some(InviteLink { room_id })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_room_id() {
        let url = build_invite_url("7f3a2b1c-0d4e-4f5a-8b6c-9d0e1f2a3b4c");
        let link = parse_invite_url(&url).unwrap();
        assert_eq!(link.room_id, "7f3a2b1c-0d4e-4f5a-8b6c-9d0e1f2a3b4c");
    }

    #[test]
    fn accepts_http_links_and_bare_queries() {
        assert_eq!(
            parse_invite_url("https://example.com/watch?room=abc").unwrap().room_id,
            "abc"
        );
        assert_eq!(parse_invite_url("room=abc").unwrap().room_id, "abc");
    }

    #[test]
    fn missing_or_empty_room_means_create() {
        assert!(parse_invite_url("").is_none());
        assert!(parse_invite_url("https://example.com/watch").is_none());
        assert!(parse_invite_url("room=").is_none());
    }

    #[test]
    fn encoded_room_ids_are_decoded() {
        let url = build_invite_url("room with spaces");
        assert!(!url.contains(' '));
        assert_eq!(parse_invite_url(&url).unwrap().room_id, "room with spaces");
    }
}
