//! On-disk account documents.
//!
//! One JSON file per non-temporary account at
//! `<directory>/<account_id as 10 decimal digits>.json`. The document
//! carries a `FormatVersion` discriminator: version 1 is the current
//! multi-credential form; version 0 is the legacy single-credential-set
//! layout, still readable so old license directories load unmodified.
//! Flags and ids serialize as hex strings.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::{Account, BbLicense, DcNteLicense, GcLicense, V1V2License, XbLicense};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("account file I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("account document error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid account document: {0}")]
    Invalid(String),
}

/// Hex-string serialization for 32-bit ids and flag words. Accepts plain
/// numbers on input for hand-edited files.
mod hex_u32 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u32, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{value:#010X}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(u64),
            Str(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Num(n) => Ok(n as u32),
            Raw::Str(s) => {
                let trimmed = s.trim_start_matches("0x").trim_start_matches("0X");
                u32::from_str_radix(trimmed, 16).map_err(serde::de::Error::custom)
            }
        }
    }
}

mod hex_u64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{value:#018X}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(u64),
            Str(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Num(n) => Ok(n),
            Raw::Str(s) => {
                let trimmed = s.trim_start_matches("0x").trim_start_matches("0X");
                u64::from_str_radix(trimmed, 16).map_err(serde::de::Error::custom)
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct DcNteLicenseDoc {
    #[serde(rename = "SerialNumber")]
    serial_number: String,
    #[serde(rename = "AccessKey")]
    access_key: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct V1V2LicenseDoc {
    #[serde(rename = "SerialNumber")]
    serial_number: u32,
    #[serde(rename = "AccessKey")]
    access_key: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct GcLicenseDoc {
    #[serde(rename = "SerialNumber")]
    serial_number: u32,
    #[serde(rename = "AccessKey")]
    access_key: String,
    #[serde(rename = "Password")]
    password: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct XbLicenseDoc {
    #[serde(rename = "GamerTag")]
    gamertag: String,
    #[serde(rename = "UserID", with = "hex_u64")]
    user_id: u64,
    #[serde(rename = "AccountID", with = "hex_u64")]
    account_id: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct BbLicenseDoc {
    #[serde(rename = "UserName")]
    username: String,
    #[serde(rename = "Password")]
    password: String,
}

/// The serialized account shape, both format versions.
#[derive(Debug, Serialize, Deserialize)]
struct AccountDocument {
    #[serde(rename = "FormatVersion", default)]
    format_version: u32,
    #[serde(rename = "AccountID", with = "hex_u32")]
    account_id: u32,
    #[serde(rename = "Flags", with = "hex_u32", default)]
    flags: u32,
    #[serde(rename = "UserFlags", with = "hex_u32", default)]
    user_flags: u32,
    #[serde(rename = "BanEndTime", default)]
    ban_end_time: u64,
    #[serde(rename = "LastPlayerName", default)]
    last_player_name: String,
    #[serde(rename = "AutoReplyMessage", default)]
    auto_reply_message: String,
    #[serde(rename = "Ep3CurrentMeseta", default)]
    ep3_current_meseta: u32,
    #[serde(rename = "Ep3TotalMesetaEarned", default)]
    ep3_total_meseta_earned: u32,
    #[serde(rename = "BBTeamID", default)]
    bb_team_id: u32,
    #[serde(rename = "AutoPatchesEnabled", default)]
    auto_patches_enabled: Vec<String>,

    // Format version 1: independently-keyed credential lists.
    #[serde(rename = "DCNTELicenses", default, skip_serializing_if = "Vec::is_empty")]
    dc_nte_licenses: Vec<DcNteLicenseDoc>,
    #[serde(rename = "DCLicenses", default, skip_serializing_if = "Vec::is_empty")]
    dc_licenses: Vec<V1V2LicenseDoc>,
    #[serde(rename = "PCLicenses", default, skip_serializing_if = "Vec::is_empty")]
    pc_licenses: Vec<V1V2LicenseDoc>,
    #[serde(rename = "GCLicenses", default, skip_serializing_if = "Vec::is_empty")]
    gc_licenses: Vec<GcLicenseDoc>,
    #[serde(rename = "XBLicenses", default, skip_serializing_if = "Vec::is_empty")]
    xb_licenses: Vec<XbLicenseDoc>,
    #[serde(rename = "BBLicenses", default, skip_serializing_if = "Vec::is_empty")]
    bb_licenses: Vec<BbLicenseDoc>,

    // Format version 0: one credential set inline on the document.
    #[serde(rename = "SerialNumber", default, skip_serializing_if = "Option::is_none")]
    legacy_serial_number: Option<u32>,
    #[serde(rename = "AccessKey", default, skip_serializing_if = "Option::is_none")]
    legacy_access_key: Option<String>,
    #[serde(rename = "GCPassword", default, skip_serializing_if = "Option::is_none")]
    legacy_gc_password: Option<String>,
    #[serde(rename = "BBUsername", default, skip_serializing_if = "Option::is_none")]
    legacy_bb_username: Option<String>,
    #[serde(rename = "BBPassword", default, skip_serializing_if = "Option::is_none")]
    legacy_bb_password: Option<String>,
}

impl AccountDocument {
    fn from_account(account: &Account) -> Self {
        AccountDocument {
            format_version: 1,
            account_id: account.account_id,
            flags: account.flags,
            user_flags: account.user_flags,
            ban_end_time: account.ban_end_time,
            last_player_name: account.last_player_name.clone(),
            auto_reply_message: account.auto_reply_message.clone(),
            ep3_current_meseta: account.ep3_current_meseta,
            ep3_total_meseta_earned: account.ep3_total_meseta_earned,
            bb_team_id: account.bb_team_id,
            auto_patches_enabled: {
                let mut names: Vec<String> = account.auto_patches_enabled.iter().cloned().collect();
                names.sort();
                names
            },
            dc_nte_licenses: account
                .dc_nte_licenses
                .values()
                .map(|l| DcNteLicenseDoc {
                    serial_number: l.serial_number.clone(),
                    access_key: l.access_key.clone(),
                })
                .collect(),
            dc_licenses: account
                .dc_licenses
                .values()
                .map(|l| V1V2LicenseDoc {
                    serial_number: l.serial_number,
                    access_key: l.access_key.clone(),
                })
                .collect(),
            pc_licenses: account
                .pc_licenses
                .values()
                .map(|l| V1V2LicenseDoc {
                    serial_number: l.serial_number,
                    access_key: l.access_key.clone(),
                })
                .collect(),
            gc_licenses: account
                .gc_licenses
                .values()
                .map(|l| GcLicenseDoc {
                    serial_number: l.serial_number,
                    access_key: l.access_key.clone(),
                    password: l.password.clone(),
                })
                .collect(),
            xb_licenses: account
                .xb_licenses
                .values()
                .map(|l| XbLicenseDoc {
                    gamertag: l.gamertag.clone(),
                    user_id: l.user_id,
                    account_id: l.account_id,
                })
                .collect(),
            bb_licenses: account
                .bb_licenses
                .values()
                .map(|l| BbLicenseDoc {
                    username: l.username.clone(),
                    password: l.password.clone(),
                })
                .collect(),
            legacy_serial_number: None,
            legacy_access_key: None,
            legacy_gc_password: None,
            legacy_bb_username: None,
            legacy_bb_password: None,
        }
    }

    fn into_account(self) -> Result<Account, StoreError> {
        let mut account = Account {
            account_id: self.account_id,
            flags: self.flags,
            user_flags: self.user_flags,
            ban_end_time: self.ban_end_time,
            last_player_name: self.last_player_name,
            auto_reply_message: self.auto_reply_message,
            ep3_current_meseta: self.ep3_current_meseta,
            ep3_total_meseta_earned: self.ep3_total_meseta_earned,
            bb_team_id: self.bb_team_id,
            is_temporary: false,
            auto_patches_enabled: self.auto_patches_enabled.into_iter().collect(),
            ..Default::default()
        };

        match self.format_version {
            0 => {
                // Legacy documents store one credential set inline. An
                // 8-character access key was usable on both DC and PC.
                if let (Some(serial), Some(key)) = (self.legacy_serial_number, &self.legacy_access_key) {
                    if key.len() == 8 {
                        let license = V1V2License {
                            serial_number: serial,
                            access_key: key.clone(),
                        };
                        account.dc_licenses.insert(serial, license.clone());
                        account.pc_licenses.insert(serial, license);
                    }
                    if let Some(password) = &self.legacy_gc_password {
                        account.gc_licenses.insert(
                            serial,
                            GcLicense {
                                serial_number: serial,
                                access_key: key.clone(),
                                password: password.clone(),
                            },
                        );
                    }
                }
                if let (Some(username), Some(password)) =
                    (self.legacy_bb_username, self.legacy_bb_password)
                {
                    account.bb_licenses.insert(
                        username.clone(),
                        BbLicense { username, password },
                    );
                }
            }
            1 => {
                for doc in self.dc_nte_licenses {
                    let license = DcNteLicense {
                        serial_number: doc.serial_number,
                        access_key: doc.access_key,
                    };
                    license.validate().map_err(StoreError::Invalid)?;
                    account
                        .dc_nte_licenses
                        .insert(license.serial_number.clone(), license);
                }
                for doc in self.dc_licenses {
                    let license = V1V2License {
                        serial_number: doc.serial_number,
                        access_key: doc.access_key,
                    };
                    license.validate().map_err(StoreError::Invalid)?;
                    account.dc_licenses.insert(license.serial_number, license);
                }
                for doc in self.pc_licenses {
                    let license = V1V2License {
                        serial_number: doc.serial_number,
                        access_key: doc.access_key,
                    };
                    license.validate().map_err(StoreError::Invalid)?;
                    account.pc_licenses.insert(license.serial_number, license);
                }
                for doc in self.gc_licenses {
                    let license = GcLicense {
                        serial_number: doc.serial_number,
                        access_key: doc.access_key,
                        password: doc.password,
                    };
                    license.validate().map_err(StoreError::Invalid)?;
                    account.gc_licenses.insert(license.serial_number, license);
                }
                for doc in self.xb_licenses {
                    let license = XbLicense {
                        gamertag: doc.gamertag,
                        user_id: doc.user_id,
                        account_id: doc.account_id,
                    };
                    license.validate().map_err(StoreError::Invalid)?;
                    account.xb_licenses.insert(license.user_id, license);
                }
                for doc in self.bb_licenses {
                    let license = BbLicense {
                        username: doc.username,
                        password: doc.password,
                    };
                    license.validate().map_err(StoreError::Invalid)?;
                    account.bb_licenses.insert(license.username.clone(), license);
                }
            }
            v => {
                return Err(StoreError::Invalid(format!("unknown FormatVersion {v}")));
            }
        }
        Ok(account)
    }
}

/// File name for an account: ten decimal digits plus `.json`.
pub fn account_file_name(account_id: u32) -> String {
    format!("{account_id:010}.json")
}

pub fn account_path(directory: &Path, account_id: u32) -> PathBuf {
    directory.join(account_file_name(account_id))
}

/// Serialize an account to its JSON document.
pub fn serialize_account(account: &Account) -> Result<String, StoreError> {
    Ok(serde_json::to_string_pretty(&AccountDocument::from_account(account))?)
}

/// Parse an account document.
pub fn parse_account(json: &str) -> Result<Account, StoreError> {
    serde_json::from_str::<AccountDocument>(json)?.into_account()
}

/// Write one account's document under `directory`.
pub fn save_account(directory: &Path, account: &Account) -> Result<(), StoreError> {
    std::fs::create_dir_all(directory)?;
    let path = account_path(directory, account.account_id);
    std::fs::write(path, serialize_account(account)?)?;
    Ok(())
}

/// Delete an account's document, if present.
pub fn delete_account_file(directory: &Path, account_id: u32) -> Result<(), StoreError> {
    let path = account_path(directory, account_id);
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Load every `.json` document under `directory`.
pub fn load_directory(directory: &Path) -> Result<Vec<Account>, StoreError> {
    let mut accounts = Vec::new();
    if !directory.is_dir() {
        return Ok(accounts);
    }
    for entry in std::fs::read_dir(directory)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            let json = std::fs::read_to_string(&path)?;
            let account = parse_account(&json).map_err(|e| {
                StoreError::Invalid(format!("{}: {e}", path.display()))
            })?;
            accounts.push(account);
        }
    }
    Ok(accounts)
}
