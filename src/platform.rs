use std::time::Duration;

use anyhow::{bail, Result};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::USER_AGENT;
use serde::{Deserialize, Serialize};
use url::Url;

pub const API_BASE: &str = "https://api.tales.example/v1";

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub base_url: String,
    pub user_agent: String,
    pub http_client: Option<HttpClient>,
}

/// Scope of a feed instance. Set at construction of a feed and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Context {
    /// The ambient recommendation stream.
    Ambient,
    /// Replies to a single tale.
    Tale(String),
    /// Tales published by a single author.
    Author(String),
}

impl Context {
    pub fn has_summary(&self) -> bool {
        !matches!(self, Context::Ambient)
    }

    pub fn label(&self) -> String {
        match self {
            Context::Ambient => "For you".to_string(),
            Context::Tale(id) => format!("Tale {}", id),
            Context::Author(name) => format!("@{}", name),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tale {
    pub id: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub image_paths: Vec<String>,
    #[serde(default)]
    pub reply_count: i64,
    #[serde(default)]
    pub reaction_count: i64,
    #[serde(default)]
    pub created_utc: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TalePage {
    #[serde(default)]
    pub items: Vec<Tale>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorSummary {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub bio: String,
    #[serde(default)]
    pub tale_count: i64,
    #[serde(default)]
    pub follower_count: i64,
}

/// The pinned context card loaded once per feed, separate from pagination.
#[derive(Debug, Clone)]
pub enum ContextSummary {
    Tale(Tale),
    Author(AuthorSummary),
}

pub struct Client {
    http: HttpClient,
    user_agent: String,
    base_url: String,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.user_agent.trim().is_empty() {
            bail!("platform client user agent required");
        }

        let base_url = if config.base_url.trim().is_empty() {
            API_BASE.to_string()
        } else {
            config.base_url.trim_end_matches('/').to_string()
        };
        Url::parse(&base_url)?;

        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(Duration::from_secs(20))
                .build()?,
        };

        Ok(Client {
            http,
            user_agent: config.user_agent,
            base_url,
        })
    }

    /// Requests the next page of tales for a context. The server tracks the
    /// continuation point; the client only asks for "more".
    pub fn tales_after(&self, context: &Context) -> Result<TalePage> {
        let url = match context {
            Context::Ambient => format!("{}/feed/recommended", self.base_url),
            Context::Tale(id) => format!("{}/tales/{}/replies", self.base_url, id),
            Context::Author(name) => format!("{}/authors/{}/tales", self.base_url, name),
        };
        let page: TalePage = self
            .http
            .get(&url)
            .header(USER_AGENT, &self.user_agent)
            .send()?
            .error_for_status()?
            .json()?;
        Ok(page)
    }

    pub fn tale_summary(&self, id: &str) -> Result<Tale> {
        let url = format!("{}/tales/{}", self.base_url, id);
        let tale: Tale = self
            .http
            .get(&url)
            .header(USER_AGENT, &self.user_agent)
            .send()?
            .error_for_status()?
            .json()?;
        Ok(tale)
    }

    pub fn author_summary(&self, name: &str) -> Result<AuthorSummary> {
        let url = format!("{}/authors/{}", self.base_url, name);
        let author: AuthorSummary = self
            .http
            .get(&url)
            .header(USER_AGENT, &self.user_agent)
            .send()?
            .error_for_status()?
            .json()?;
        Ok(author)
    }

    pub fn report_viewed(&self, tale_id: &str) -> Result<()> {
        let url = format!("{}/tales/{}/viewed", self.base_url, tale_id);
        self.http
            .post(&url)
            .header(USER_AGENT, &self.user_agent)
            .send()?
            .error_for_status()?;
        Ok(())
    }

    pub fn pin_tale(&self, tale_id: &str) -> Result<()> {
        let url = format!("{}/tales/{}/pin", self.base_url, tale_id);
        self.http
            .post(&url)
            .header(USER_AGENT, &self.user_agent)
            .send()?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_requires_user_agent() {
        let err = Client::new(ClientConfig::default());
        assert!(err.is_err());
    }

    #[test]
    fn client_rejects_invalid_base_url() {
        let err = Client::new(ClientConfig {
            base_url: "not a url".into(),
            user_agent: "tales-tui/0.1".into(),
            http_client: None,
        });
        assert!(err.is_err());
    }

    #[test]
    fn tale_deserializes_from_wire_json() {
        let tale: Tale = serde_json::from_str(
            r#"{"id":"t1","author":"mira","title":"Hi","body":"Hello","image_paths":["a.png"]}"#,
        )
        .unwrap();
        assert_eq!(tale.id, "t1");
        assert_eq!(tale.image_paths, ["a.png"]);
        assert_eq!(tale.reply_count, 0);
    }

    #[test]
    fn empty_page_deserializes() {
        let page: TalePage = serde_json::from_str("{}").unwrap();
        assert!(page.items.is_empty());
    }

    #[test]
    fn context_summary_scope() {
        assert!(!Context::Ambient.has_summary());
        assert!(Context::Tale("t1".into()).has_summary());
        assert!(Context::Author("mira".into()).has_summary());
    }
}
