//! Outbound mail abstraction.
//!
//! Handlers hand messages to a `Mailer` and never wait on delivery outcome:
//! a failed send is logged and the request continues. The default sender is
//! `LogMailer`, which logs the message and returns `Ok(())`.

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{error, info};

use crate::accounts::Account;

pub const REGISTRATION_CONFIRMATION: &str = "registration_confirmation";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmailMessage {
    pub to_email: String,
    pub template: String,
    pub payload_json: String,
}

impl EmailMessage {
    /// Confirmation mail for an account that has an email on file.
    ///
    /// # Errors
    /// Returns an error if the account has no email.
    pub fn registration_confirmation(account: &Account) -> Result<Self> {
        let to_email = account
            .email
            .clone()
            .context("account has no email to confirm")?;
        let payload = json!({
            "account_id": account.id,
            "name": account.name,
            "email": to_email,
        });
        Ok(Self {
            to_email,
            template: REGISTRATION_CONFIRMATION.to_string(),
            payload_json: payload.to_string(),
        })
    }
}

/// Delivery abstraction; implementations decide the transport.
pub trait Mailer: Send + Sync {
    /// Deliver a message or return an error.
    fn send(&self, message: &EmailMessage) -> Result<()>;
}

/// Sender that logs the payload instead of sending real email.
#[derive(Clone, Debug)]
pub struct LogMailer;

impl Mailer for LogMailer {
    fn send(&self, message: &EmailMessage) -> Result<()> {
        info!(
            to_email = %message.to_email,
            template = %message.template,
            payload = %message.payload_json,
            "mail send stub"
        );
        Ok(())
    }
}

/// Queue a confirmation mail; failures are logged only.
pub fn enqueue_confirmation(mailer: &dyn Mailer, account: &Account) {
    let result =
        EmailMessage::registration_confirmation(account).and_then(|message| mailer.send(&message));
    if let Err(err) = result {
        error!("Failed to send confirmation mail to {}: {:?}", account.name, err);
    }
}
