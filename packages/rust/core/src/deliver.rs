//! Delivery boundary and the Brevo transactional email client.

use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use url::Url;

use newsfeed_shared::{DeliveryConfig, DeliveryReceipt, NewsfeedError, Result, SummaryReport};

const USER_AGENT: &str = concat!("newsfeed/", env!("CARGO_PKG_VERSION"));

/// A fully composed message, ready for the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutgoingEmail {
    pub subject: String,
    pub html: String,
    pub text: String,
    pub recipients: Vec<String>,
}

/// Hands a composed report to an email provider.
#[async_trait]
pub trait DeliveryService: Send + Sync {
    async fn deliver(&self, email: &OutgoingEmail) -> Result<DeliveryReceipt>;
}

/// Build the message for `report`. The Markdown rendering doubles as the
/// plain-text part.
pub fn compose_email(
    report: &SummaryReport,
    markdown: &str,
    config: &DeliveryConfig,
) -> Result<OutgoingEmail> {
    if config.recipients.is_empty() {
        return Err(NewsfeedError::config("delivery.recipients is empty"));
    }
    Ok(OutgoingEmail {
        subject: format!("{}: {}", config.subject_prefix.trim(), report.date_range),
        html: render_html(report),
        text: markdown.to_string(),
        recipients: config.recipients.clone(),
    })
}

fn render_html(report: &SummaryReport) -> String {
    let mut html = String::from("<html><body>\n");
    let _ = writeln!(html, "<h1>{}</h1>", escape_html(&report.title));
    let _ = writeln!(html, "<p><em>{}</em></p>", escape_html(&report.date_range));
    let _ = writeln!(html, "<p>{}</p>", escape_html(&report.overview));

    for section in &report.sections {
        let _ = writeln!(html, "<h2>{}</h2>", escape_html(&section.entity));
        let _ = writeln!(html, "<h3>{}</h3>", escape_html(&section.headline));
        let _ = writeln!(html, "<p>{}</p>", escape_html(&section.body));
    }

    if !report.citations.is_empty() {
        html.push_str("<h2>Sources</h2>\n<ol>\n");
        for c in &report.citations {
            let _ = writeln!(
                html,
                "<li><a href=\"{}\">{}</a> ({})</li>",
                escape_html(&c.url),
                escape_html(&c.title),
                escape_html(&c.entity)
            );
        }
        html.push_str("</ol>\n");
    }
    html.push_str("</body></html>\n");
    html
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Brevo
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BrevoResponse {
    message_id: Option<String>,
}

pub struct BrevoDelivery {
    client: Client,
    endpoint: Url,
    api_key: String,
    sender_email: String,
    sender_name: String,
}

impl BrevoDelivery {
    pub fn new(config: &DeliveryConfig, api_key: String, timeout: Duration) -> Result<Self> {
        let endpoint = Url::parse(&config.endpoint).map_err(|e| {
            NewsfeedError::config(format!(
                "invalid delivery endpoint '{}': {e}",
                config.endpoint
            ))
        })?;
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| NewsfeedError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            api_key,
            sender_email: config.sender_email.clone(),
            sender_name: config.sender_name.clone(),
        })
    }
}

#[async_trait]
impl DeliveryService for BrevoDelivery {
    #[instrument(skip_all, fields(recipients = email.recipients.len()))]
    async fn deliver(&self, email: &OutgoingEmail) -> Result<DeliveryReceipt> {
        let to: Vec<serde_json::Value> = email
            .recipients
            .iter()
            .map(|r| serde_json::json!({ "email": r }))
            .collect();
        let body = serde_json::json!({
            "sender": { "name": self.sender_name, "email": self.sender_email },
            "to": to,
            "subject": email.subject,
            "htmlContent": email.html,
            "textContent": email.text,
        });

        let response = self
            .client
            .post(self.endpoint.clone())
            .header("api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| NewsfeedError::delivery(format!("brevo request: {e}"), true))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            let retryable = status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
            return Err(NewsfeedError::delivery(
                format!("brevo HTTP {status}: {}", detail.trim()),
                retryable,
            ));
        }

        let parsed: BrevoResponse = response
            .json()
            .await
            .unwrap_or(BrevoResponse { message_id: None });

        info!(message_id = ?parsed.message_id, "report delivered");
        Ok(DeliveryReceipt {
            message_id: parsed.message_id,
            recipients: email.recipients.clone(),
            subject: email.subject.clone(),
            delivered_at: Utc::now(),
        })
    }
}
