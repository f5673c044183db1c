//! Account store
//!
//! Accounts are keyed by the lowercase-hex SHA-256 of the email
//! address. The persisted file holds only that hash, base64 salted
//! PBKDF2 credentials, and AES envelopes of the display name and
//! contact map -- never a plaintext email or name. The plaintext email
//! is held in memory only between a successful login and the session's
//! teardown, because it is the envelope key.

use crate::crypto;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Generic failure message for login; absent user and wrong password
/// are indistinguishable.
pub const INVALID_CREDENTIALS: &str = "Email and Password Combination Invalid.";

/// Salted PBKDF2 credentials, both fields base64.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRecord {
    pub salt: String,
    pub key: String,
}

/// One persisted account. The `email` field holds the email hash;
/// `name` and `contacts` are base64 envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRecord {
    pub email: String,
    pub name: String,
    pub contacts: String,
    pub auth: AuthRecord,
}

/// An account plus the decrypted state available while its owner is
/// logged in.
#[derive(Debug, Clone)]
struct Account {
    record: AccountRecord,
    /// Present only between login and session teardown.
    plaintext_email: Option<String>,
    name: Option<String>,
    contacts: BTreeMap<String, String>,
}

impl Account {
    const fn new(record: AccountRecord) -> Self {
        Self {
            record,
            plaintext_email: None,
            name: None,
            contacts: BTreeMap::new(),
        }
    }
}

/// In-memory user registry with JSON persistence.
pub struct AccountStore {
    path: PathBuf,
    accounts: HashMap<String, Account>,
}

impl AccountStore {
    /// Open the store, loading `path` if it exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut accounts = HashMap::new();
        if path.exists() {
            let data = std::fs::read_to_string(&path)?;
            let records: HashMap<String, AccountRecord> = serde_json::from_str(&data)?;
            for (hash, record) in records {
                accounts.insert(hash, Account::new(record));
            }
        }
        debug!("Loaded {} account(s) from {}", accounts.len(), path.display());
        Ok(Self { path, accounts })
    }

    /// Number of stored accounts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Register a new account. Returns an empty string on success, the
    /// error text otherwise. A successful registration leaves the
    /// account decrypted in memory, exactly as a login would.
    pub fn register(&mut self, name: &str, email: &str, password: &str) -> String {
        let email = email.trim();
        if !validate_email(email) {
            return "Email address is invalid.".into();
        }
        let hash = crypto::email_hash(email);
        if self.accounts.contains_key(&hash) {
            return "User already exists.".into();
        }

        let salt = crypto::make_salt();
        let key = crypto::derive_login_key(password, &salt);
        let (enc_name, enc_contacts) = match encrypt_profile(name, &BTreeMap::new(), email) {
            Ok(pair) => pair,
            Err(e) => return e.to_string(),
        };

        let record = AccountRecord {
            email: hash.clone(),
            name: enc_name,
            contacts: enc_contacts,
            auth: AuthRecord {
                salt: b64(&salt),
                key: b64(&key),
            },
        };
        let mut account = Account::new(record);
        account.plaintext_email = Some(email.to_string());
        account.name = Some(name.to_string());
        self.accounts.insert(hash, account);

        if let Err(e) = self.persist() {
            warn!("Failed to persist account store: {e}");
            return "Could not save account data.".into();
        }
        debug!("User registered");
        String::new()
    }

    /// Authenticate. Returns an empty string on success. On success
    /// the plaintext email is stashed on the record and the contact
    /// map is decrypted into memory.
    pub fn authenticate(&mut self, email: &str, password: &str) -> String {
        let email = email.trim();
        let hash = crypto::email_hash(email);
        let Some(account) = self.accounts.get_mut(&hash) else {
            return INVALID_CREDENTIALS.into();
        };

        let (Ok(salt), Ok(stored_key)) = (
            base64_decode(&account.record.auth.salt),
            base64_decode(&account.record.auth.key),
        ) else {
            warn!("Corrupt auth record for {hash}");
            return INVALID_CREDENTIALS.into();
        };
        let candidate = crypto::derive_login_key(password, &salt);
        if !crypto::verify_login_key(&candidate, &stored_key) {
            return INVALID_CREDENTIALS.into();
        }

        let decrypted = crypto::decrypt_field(&account.record.name, email).and_then(|name| {
            let contacts = crypto::decrypt_field(&account.record.contacts, email)?;
            let contacts: BTreeMap<String, String> = serde_json::from_str(&contacts)?;
            Ok((name, contacts))
        });
        let (name, contacts) = match decrypted {
            Ok(pair) => pair,
            Err(e) => {
                warn!("Failed to decrypt profile for {hash}: {e}");
                return INVALID_CREDENTIALS.into();
            }
        };
        account.plaintext_email = Some(email.to_string());
        account.name = Some(name);
        account.contacts = contacts;
        String::new()
    }

    /// Add (or rename) a contact on the owner's decrypted contact map,
    /// re-encrypt, and persist. Returns an empty string on success.
    pub fn add_contact(&mut self, owner_email: &str, contact_name: &str, contact_email: &str) -> String {
        let contact_email = contact_email.trim();
        if contact_name.trim().is_empty() || contact_email.is_empty() {
            return "Name and email must both be non-empty.".into();
        }
        if !validate_email(contact_email) {
            return "Email address is invalid.".into();
        }

        let hash = crypto::email_hash(owner_email.trim());
        let Some(account) = self.accounts.get_mut(&hash) else {
            return "No such user.".into();
        };
        if account.plaintext_email.is_none() {
            return "Not authenticated.".into();
        }

        account
            .contacts
            .insert(contact_email.to_string(), contact_name.to_string());
        let email = account.plaintext_email.clone().unwrap_or_default();
        let contacts_json = match serde_json::to_string(&account.contacts) {
            Ok(json) => json,
            Err(e) => return e.to_string(),
        };
        match crypto::encrypt_field(&contacts_json, &email) {
            Ok(enc) => account.record.contacts = enc,
            Err(e) => return e.to_string(),
        }

        if let Err(e) = self.persist() {
            warn!("Failed to persist account store: {e}");
            return "Could not save account data.".into();
        }
        String::new()
    }

    /// Whether `owner`'s decrypted contact map contains `other`.
    #[must_use]
    pub fn contacts_contains(&self, owner_email: &str, other_email: &str) -> bool {
        self.account(owner_email)
            .is_some_and(|a| a.contacts.contains_key(other_email.trim()))
    }

    /// The owner's decrypted contact map (empty if unknown or not
    /// logged in).
    #[must_use]
    pub fn get_contacts(&self, owner_email: &str) -> BTreeMap<String, String> {
        self.account(owner_email)
            .map(|a| a.contacts.clone())
            .unwrap_or_default()
    }

    /// The owner's decrypted display name, if logged in.
    #[must_use]
    pub fn display_name(&self, owner_email: &str) -> Option<String> {
        self.account(owner_email).and_then(|a| a.name.clone())
    }

    /// Drop the in-memory plaintext email and decrypted profile for a
    /// user whose session ended.
    pub fn scrub(&mut self, email: &str) {
        let hash = crypto::email_hash(email.trim());
        if let Some(account) = self.accounts.get_mut(&hash) {
            account.plaintext_email = None;
            account.name = None;
            account.contacts.clear();
        }
    }

    fn account(&self, email: &str) -> Option<&Account> {
        self.accounts.get(&crypto::email_hash(email.trim()))
    }

    /// Serialize the full account set and atomically replace the
    /// persisted file.
    fn persist(&self) -> Result<()> {
        let records: BTreeMap<&String, &AccountRecord> = self
            .accounts
            .iter()
            .map(|(hash, account)| (hash, &account.record))
            .collect();
        let json = serde_json::to_string(&records)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Syntactic email validation: exactly one `@`, a non-empty local
/// part, a dot somewhere in the domain, and no whitespace or control
/// characters. Non-ASCII UTF-8 is accepted; no deliverability lookup.
#[must_use]
pub fn validate_email(email: &str) -> bool {
    if email.is_empty() || email.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
}

fn encrypt_profile(
    name: &str,
    contacts: &BTreeMap<String, String>,
    email: &str,
) -> Result<(String, String)> {
    let enc_name = crypto::encrypt_field(name, email)?;
    let contacts_json = serde_json::to_string(contacts)?;
    let enc_contacts = crypto::encrypt_field(&contacts_json, email)?;
    Ok((enc_name, enc_contacts))
}

fn b64(bytes: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn base64_decode(encoded: &str) -> Result<Vec<u8>> {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| crate::error::Error::Crypto(format!("invalid base64: {e}")))
}
