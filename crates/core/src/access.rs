/// Who may talk to the bot and who may approve channel posts.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    pub auth_enabled: bool,
    allowed_users: Vec<String>,
    pub admin_id: Option<i64>,
}

impl AccessPolicy {
    pub fn new(auth_enabled: bool, allowed_users: &str, admin_id: Option<i64>) -> Self {
        Self {
            auth_enabled,
            allowed_users: parse_user_list(allowed_users),
            admin_id,
        }
    }

    pub fn allowed_users(&self) -> &[String] {
        &self.allowed_users
    }

    pub fn is_authorized(&self, user_id: i64, username: Option<&str>) -> bool {
        if !self.auth_enabled {
            return true;
        }

        let id = user_id.to_string();
        let name = username.map(|name| name.trim_start_matches('@').to_lowercase());
        self.allowed_users
            .iter()
            .any(|allowed| *allowed == id || Some(allowed) == name.as_ref())
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.admin_id == Some(user_id)
    }
}

/// `"@Abebe, 12345;kebede"` -> `["abebe", "12345", "kebede"]`.
pub fn parse_user_list(raw: &str) -> Vec<String> {
    raw.split(|ch: char| ch.is_whitespace() || matches!(ch, ',' | ';' | '，' | '；'))
        .map(|entry| entry.trim().trim_start_matches('@').to_lowercase())
        .filter(|entry| !entry.is_empty())
        .collect()
}
