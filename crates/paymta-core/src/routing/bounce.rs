//! Payment bounce message

use chrono::{DateTime, Utc};
use mail_builder::headers::date::Date;
use mail_builder::MessageBuilder;
use minijinja::{context, Environment};
use paymta_common::types::{local_part, Envelope};
use paymta_common::Config;

const BOUNCE_TEMPLATE: &str = include_str!("../../templates/bounce.txt");

/// Everything the bounce text needs
#[derive(Debug, Clone)]
pub struct BounceNotice {
    pub quarantine_id: String,
    pub domain: String,
    /// Sender of the bounce
    pub from: String,
    /// The original sender
    pub to: String,
    /// The unpaid recipient
    pub reply_to: String,
    pub original_subject: String,
    pub date: DateTime<Utc>,
    pub mail_size: usize,
    pub price: String,
    pub payment_link: String,
}

impl BounceNotice {
    pub fn new(
        config: &Config,
        recipient: &str,
        original: &Envelope,
        quarantine_id: &str,
        subject: &str,
    ) -> Self {
        Self {
            quarantine_id: quarantine_id.to_string(),
            domain: config.server.domain.clone(),
            from: config.bounce_sender(),
            to: original.sender.clone(),
            reply_to: recipient.to_string(),
            original_subject: subject.to_string(),
            date: Utc::now(),
            mail_size: original.data.len(),
            price: config.quarantine.price.clone(),
            payment_link: format!(
                "{}/{}/{}",
                config.payment_base_url(),
                local_part(recipient),
                quarantine_id
            ),
        }
    }

    fn render_body(&self) -> Result<String, minijinja::Error> {
        Environment::new().render_str(
            BOUNCE_TEMPLATE,
            context! {
                quarantine_id => &self.quarantine_id,
                domain => &self.domain,
                recipient => &self.reply_to,
                original_subject => &self.original_subject,
                date => self.date.to_rfc2822(),
                mail_size => format!("{}B", self.mail_size),
                price => &self.price,
                payment_link => &self.payment_link,
            },
        )
    }
}

/// Build the bounce envelope sent back to the original sender
pub fn build_bounce(notice: &BounceNotice) -> anyhow::Result<Envelope> {
    let body = notice.render_body()?;

    let data = MessageBuilder::new()
        .from(notice.from.as_str())
        .to(notice.to.as_str())
        .reply_to(notice.reply_to.as_str())
        .subject(format!("Payment required: {}", notice.original_subject))
        .date(Date::new(notice.date.timestamp()))
        .message_id(format!("{}@{}", notice.quarantine_id, notice.domain))
        .text_body(body)
        .write_to_vec()?;

    Ok(Envelope::new(notice.from.clone(), vec![notice.to.clone()], data))
}
