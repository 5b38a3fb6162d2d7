//! The concurrent account index.
//!
//! Lookups take the read lock; the login paths follow an upgrade pattern:
//! shared-lock lookup first, then on a miss (and with creation allowed) a
//! write-lock re-check before creating. The index is consulted from both
//! the game and patch listeners, so it is fully thread-safe.
//!
//! Invariant: every credential key (DC serial, PC serial, GC serial, XB
//! user id, BB username, DC NTE serial string) maps to at most one account
//! across the whole index.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use super::store::{self, StoreError};
use super::{
    derived_shared_account_id, Account, BbLicense, Credential, DcNteLicense, GcLicense, Login,
    V1V2License, XbLicense,
};
use crate::error::AccountError;
use ragol_proto::fnv1a32;

/// A reference-counted, lockable account.
pub type SharedAccount = Arc<RwLock<Account>>;

fn now_epoch() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

#[derive(Default)]
struct Inner {
    by_account_id: HashMap<u32, SharedAccount>,
    by_dc_nte_serial: HashMap<String, SharedAccount>,
    by_dc_serial: HashMap<u32, SharedAccount>,
    by_pc_serial: HashMap<u32, SharedAccount>,
    by_gc_serial: HashMap<u32, SharedAccount>,
    by_xb_user_id: HashMap<u64, SharedAccount>,
    by_bb_username: HashMap<String, SharedAccount>,
}

pub struct AccountIndex {
    /// `None` forces every account to be temporary (nothing persists).
    directory: Option<PathBuf>,
    inner: RwLock<Inner>,
}

impl AccountIndex {
    /// Create an index backed by `directory`, loading every document in it.
    /// Pass `None` to run fully in-memory.
    pub fn new(directory: Option<PathBuf>) -> Result<Self, StoreError> {
        let index = AccountIndex {
            directory,
            inner: RwLock::new(Inner::default()),
        };
        if let Some(dir) = &index.directory {
            let accounts = store::load_directory(dir)?;
            let count = accounts.len();
            let mut inner = index.inner.write();
            for account in accounts {
                if let Err(e) = Self::add_locked(&mut inner, Arc::new(RwLock::new(account))) {
                    warn!(error = %e, "Skipping conflicting account document");
                }
            }
            drop(inner);
            info!(count, "Loaded account index");
        }
        Ok(index)
    }

    pub fn count(&self) -> usize {
        self.inner.read().by_account_id.len()
    }

    pub fn all(&self) -> Vec<SharedAccount> {
        self.inner.read().by_account_id.values().cloned().collect()
    }

    pub fn from_account_id(&self, account_id: u32) -> Option<SharedAccount> {
        self.inner.read().by_account_id.get(&account_id).cloned()
    }

    /// Persist one account (no-op for temporary accounts or in-memory
    /// indexes).
    pub fn save(&self, account: &Account) {
        if account.is_temporary {
            return;
        }
        if let Some(dir) = &self.directory {
            if let Err(e) = store::save_account(dir, account) {
                warn!(account_id = account.account_id, error = %e, "Failed to persist account");
            }
        }
    }

    /// Add a fully-formed account. Credential collisions are rejected; a
    /// zero or colliding account id is walked forward to the next free id.
    pub fn add(&self, account: SharedAccount) -> Result<(), AccountError> {
        let mut inner = self.inner.write();
        Self::add_locked(&mut inner, account.clone())?;
        drop(inner);
        self.save(&account.read());
        Ok(())
    }

    /// Remove an account and its file.
    pub fn remove(&self, account_id: u32) -> Result<(), AccountError> {
        let mut inner = self.inner.write();
        let account = inner
            .by_account_id
            .remove(&account_id)
            .ok_or(AccountError::MissingAccount)?;
        {
            let guard = account.read();
            for serial in guard.dc_nte_licenses.keys() {
                inner.by_dc_nte_serial.remove(serial);
            }
            for serial in guard.dc_licenses.keys() {
                inner.by_dc_serial.remove(serial);
            }
            for serial in guard.pc_licenses.keys() {
                inner.by_pc_serial.remove(serial);
            }
            for serial in guard.gc_licenses.keys() {
                inner.by_gc_serial.remove(serial);
            }
            for user_id in guard.xb_licenses.keys() {
                inner.by_xb_user_id.remove(user_id);
            }
            for username in guard.bb_licenses.keys() {
                inner.by_bb_username.remove(username);
            }
        }
        drop(inner);
        let guard = account.read();
        if !guard.is_temporary {
            if let Some(dir) = &self.directory {
                if let Err(e) = store::delete_account_file(dir, account_id) {
                    warn!(account_id, error = %e, "Failed to delete account file");
                }
            }
        }
        Ok(())
    }

    fn add_locked(inner: &mut Inner, account: SharedAccount) -> Result<(), AccountError> {
        {
            let mut guard = account.write();
            for serial in guard.dc_nte_licenses.keys() {
                if inner.by_dc_nte_serial.contains_key(serial) {
                    return Err(AccountError::CredentialInUse);
                }
            }
            for serial in guard.dc_licenses.keys() {
                if inner.by_dc_serial.contains_key(serial) {
                    return Err(AccountError::CredentialInUse);
                }
            }
            for serial in guard.pc_licenses.keys() {
                if inner.by_pc_serial.contains_key(serial) {
                    return Err(AccountError::CredentialInUse);
                }
            }
            for serial in guard.gc_licenses.keys() {
                if inner.by_gc_serial.contains_key(serial) {
                    return Err(AccountError::CredentialInUse);
                }
            }
            for user_id in guard.xb_licenses.keys() {
                if inner.by_xb_user_id.contains_key(user_id) {
                    return Err(AccountError::CredentialInUse);
                }
            }
            for username in guard.bb_licenses.keys() {
                if inner.by_bb_username.contains_key(username) {
                    return Err(AccountError::CredentialInUse);
                }
            }

            // Walk to the next free 31-bit id, skipping 0 and 0xFFFFFFFF.
            while inner.by_account_id.contains_key(&guard.account_id)
                || guard.account_id == 0
                || guard.account_id == 0xFFFF_FFFF
            {
                guard.account_id = guard.account_id.wrapping_add(1) & 0x7FFF_FFFF;
            }
        }

        let guard = account.read();
        inner.by_account_id.insert(guard.account_id, account.clone());
        for serial in guard.dc_nte_licenses.keys() {
            inner.by_dc_nte_serial.insert(serial.clone(), account.clone());
        }
        for serial in guard.dc_licenses.keys() {
            inner.by_dc_serial.insert(*serial, account.clone());
        }
        for serial in guard.pc_licenses.keys() {
            inner.by_pc_serial.insert(*serial, account.clone());
        }
        for serial in guard.gc_licenses.keys() {
            inner.by_gc_serial.insert(*serial, account.clone());
        }
        for user_id in guard.xb_licenses.keys() {
            inner.by_xb_user_id.insert(*user_id, account.clone());
        }
        for username in guard.bb_licenses.keys() {
            inner.by_bb_username.insert(username.clone(), account.clone());
        }
        Ok(())
    }

    /// Mint the per-character temporary derivative of a shared account.
    fn shared_login(account: &SharedAccount, credential: Credential, variation_data: &str) -> Login {
        let guard = account.read();
        let mut derived = guard.clone();
        derived.is_temporary = true;
        derived.account_id = derived_shared_account_id(guard.account_id, variation_data);
        Login {
            account_was_created: false,
            account: Arc::new(RwLock::new(derived)),
            credential,
        }
    }

    fn check_ban(account: &SharedAccount) -> Result<(), AccountError> {
        if account.read().is_banned(now_epoch()) {
            Err(AccountError::AccountBanned)
        } else {
            Ok(())
        }
    }

    // -- DC NTE ------------------------------------------------------------

    fn dc_nte_locked(
        inner: &Inner,
        serial_number: &str,
        access_key: &str,
    ) -> Result<Option<Login>, AccountError> {
        let Some(account) = inner.by_dc_nte_serial.get(serial_number) else {
            return Ok(None);
        };
        Self::check_ban(account)?;
        let guard = account.read();
        let license = guard
            .dc_nte_licenses
            .get(serial_number)
            .ok_or(AccountError::MissingAccount)?
            .clone();
        if guard.is_shared() {
            drop(guard);
            let variation = format!("{access_key}:");
            return Ok(Some(Self::shared_login(
                account,
                Credential::DcNte(license),
                &variation,
            )));
        }
        if license.access_key != access_key {
            return Err(AccountError::IncorrectAccessKey);
        }
        drop(guard);
        Ok(Some(Login {
            account_was_created: false,
            account: account.clone(),
            credential: Credential::DcNte(license),
        }))
    }

    pub fn from_dc_nte_credentials(
        &self,
        serial_number: &str,
        access_key: &str,
        allow_create: bool,
    ) -> Result<Login, AccountError> {
        if serial_number.is_empty() {
            return Err(AccountError::NoUsername);
        }
        if let Some(login) = Self::dc_nte_locked(&self.inner.read(), serial_number, access_key)? {
            return Ok(login);
        }

        let mut inner = self.inner.write();
        if let Some(login) = Self::dc_nte_locked(&inner, serial_number, access_key)? {
            return Ok(login);
        }
        if !allow_create {
            return Err(AccountError::MissingAccount);
        }
        let license = DcNteLicense {
            serial_number: serial_number.to_string(),
            access_key: access_key.to_string(),
        };
        let mut account = Account {
            account_id: fnv1a32(serial_number.as_bytes()) & 0x7FFF_FFFF,
            ..Default::default()
        };
        account
            .dc_nte_licenses
            .insert(serial_number.to_string(), license.clone());
        let shared = Arc::new(RwLock::new(account));
        Self::add_locked(&mut inner, shared.clone())?;
        drop(inner);
        self.save(&shared.read());
        Ok(Login {
            account_was_created: true,
            account: shared,
            credential: Credential::DcNte(license),
        })
    }

    // -- DC v1/v2 ----------------------------------------------------------

    fn dc_locked(
        inner: &Inner,
        serial_number: u32,
        access_key: &str,
        character_name: &str,
    ) -> Result<Option<Login>, AccountError> {
        let Some(account) = inner.by_dc_serial.get(&serial_number) else {
            return Ok(None);
        };
        Self::check_ban(account)?;
        let guard = account.read();
        let license = guard
            .dc_licenses
            .get(&serial_number)
            .ok_or(AccountError::MissingAccount)?
            .clone();
        if guard.is_shared() {
            drop(guard);
            let variation = format!("{access_key}:{character_name}");
            return Ok(Some(Self::shared_login(
                account,
                Credential::Dc(license),
                &variation,
            )));
        }
        if license.access_key != access_key {
            return Err(AccountError::IncorrectAccessKey);
        }
        drop(guard);
        Ok(Some(Login {
            account_was_created: false,
            account: account.clone(),
            credential: Credential::Dc(license),
        }))
    }

    pub fn from_dc_credentials(
        &self,
        serial_number: u32,
        access_key: &str,
        character_name: &str,
        allow_create: bool,
    ) -> Result<Login, AccountError> {
        if serial_number == 0 {
            return Err(AccountError::NoUsername);
        }
        if let Some(login) =
            Self::dc_locked(&self.inner.read(), serial_number, access_key, character_name)?
        {
            return Ok(login);
        }

        let mut inner = self.inner.write();
        if let Some(login) = Self::dc_locked(&inner, serial_number, access_key, character_name)? {
            return Ok(login);
        }
        if !allow_create {
            return Err(AccountError::MissingAccount);
        }
        let license = V1V2License {
            serial_number,
            access_key: access_key.to_string(),
        };
        let mut account = Account {
            account_id: serial_number,
            ..Default::default()
        };
        account.dc_licenses.insert(serial_number, license.clone());
        let shared = Arc::new(RwLock::new(account));
        Self::add_locked(&mut inner, shared.clone())?;
        drop(inner);
        self.save(&shared.read());
        Ok(Login {
            account_was_created: true,
            account: shared,
            credential: Credential::Dc(license),
        })
    }

    // -- PC ----------------------------------------------------------------

    fn pc_locked(
        inner: &Inner,
        serial_number: u32,
        access_key: &str,
        character_name: &str,
    ) -> Result<Option<Login>, AccountError> {
        let Some(account) = inner.by_pc_serial.get(&serial_number) else {
            return Ok(None);
        };
        Self::check_ban(account)?;
        let guard = account.read();
        let license = guard
            .pc_licenses
            .get(&serial_number)
            .ok_or(AccountError::MissingAccount)?
            .clone();
        if guard.is_shared() {
            drop(guard);
            let variation = format!("{access_key}:{character_name}");
            return Ok(Some(Self::shared_login(
                account,
                Credential::Pc(license),
                &variation,
            )));
        }
        if license.access_key != access_key {
            return Err(AccountError::IncorrectAccessKey);
        }
        drop(guard);
        Ok(Some(Login {
            account_was_created: false,
            account: account.clone(),
            credential: Credential::Pc(license),
        }))
    }

    pub fn from_pc_credentials(
        &self,
        serial_number: u32,
        access_key: &str,
        character_name: &str,
        allow_create: bool,
    ) -> Result<Login, AccountError> {
        if serial_number == 0 {
            return Err(AccountError::NoUsername);
        }
        if let Some(login) =
            Self::pc_locked(&self.inner.read(), serial_number, access_key, character_name)?
        {
            return Ok(login);
        }

        let mut inner = self.inner.write();
        if let Some(login) = Self::pc_locked(&inner, serial_number, access_key, character_name)? {
            return Ok(login);
        }
        if !allow_create {
            return Err(AccountError::MissingAccount);
        }
        let license = V1V2License {
            serial_number,
            access_key: access_key.to_string(),
        };
        let mut account = Account {
            account_id: serial_number,
            ..Default::default()
        };
        account.pc_licenses.insert(serial_number, license.clone());
        let shared = Arc::new(RwLock::new(account));
        Self::add_locked(&mut inner, shared.clone())?;
        drop(inner);
        self.save(&shared.read());
        Ok(Login {
            account_was_created: true,
            account: shared,
            credential: Credential::Pc(license),
        })
    }

    // -- GC ----------------------------------------------------------------

    fn gc_locked(
        inner: &Inner,
        serial_number: u32,
        access_key: &str,
        password: Option<&str>,
        character_name: &str,
    ) -> Result<Option<Login>, AccountError> {
        let Some(account) = inner.by_gc_serial.get(&serial_number) else {
            return Ok(None);
        };
        Self::check_ban(account)?;
        let guard = account.read();
        let license = guard
            .gc_licenses
            .get(&serial_number)
            .ok_or(AccountError::MissingAccount)?
            .clone();
        if guard.is_shared() {
            drop(guard);
            let variation = format!("{access_key}:{character_name}");
            return Ok(Some(Self::shared_login(
                account,
                Credential::Gc(license),
                &variation,
            )));
        }
        if license.access_key != access_key {
            return Err(AccountError::IncorrectAccessKey);
        }
        if let Some(password) = password {
            if license.password != password {
                return Err(AccountError::IncorrectPassword);
            }
        }
        drop(guard);
        Ok(Some(Login {
            account_was_created: false,
            account: account.clone(),
            credential: Credential::Gc(license),
        }))
    }

    /// GC login. The password is only present in the 0xDB verify-license
    /// step; self-creation is impossible without one.
    pub fn from_gc_credentials(
        &self,
        serial_number: u32,
        access_key: &str,
        password: Option<&str>,
        character_name: &str,
        allow_create: bool,
    ) -> Result<Login, AccountError> {
        if serial_number == 0 {
            return Err(AccountError::NoUsername);
        }
        if let Some(login) = Self::gc_locked(
            &self.inner.read(),
            serial_number,
            access_key,
            password,
            character_name,
        )? {
            return Ok(login);
        }

        let mut inner = self.inner.write();
        if let Some(login) =
            Self::gc_locked(&inner, serial_number, access_key, password, character_name)?
        {
            return Ok(login);
        }
        let Some(password) = password else {
            return Err(AccountError::MissingAccount);
        };
        if !allow_create {
            return Err(AccountError::MissingAccount);
        }
        let license = GcLicense {
            serial_number,
            access_key: access_key.to_string(),
            password: password.to_string(),
        };
        let mut account = Account {
            account_id: serial_number,
            ..Default::default()
        };
        account.gc_licenses.insert(serial_number, license.clone());
        let shared = Arc::new(RwLock::new(account));
        Self::add_locked(&mut inner, shared.clone())?;
        drop(inner);
        self.save(&shared.read());
        Ok(Login {
            account_was_created: true,
            account: shared,
            credential: Credential::Gc(license),
        })
    }

    // -- XB ----------------------------------------------------------------

    fn xb_locked(inner: &Inner, user_id: u64) -> Result<Option<Login>, AccountError> {
        let Some(account) = inner.by_xb_user_id.get(&user_id) else {
            return Ok(None);
        };
        Self::check_ban(account)?;
        let guard = account.read();
        let license = guard
            .xb_licenses
            .get(&user_id)
            .ok_or(AccountError::MissingAccount)?
            .clone();
        drop(guard);
        Ok(Some(Login {
            account_was_created: false,
            account: account.clone(),
            credential: Credential::Xb(license),
        }))
    }

    /// Xbox login: the Xbox Live handshake already authenticated the
    /// identity tuple, so there is no secret to check.
    pub fn from_xb_credentials(
        &self,
        gamertag: &str,
        user_id: u64,
        account_id: u64,
        allow_create: bool,
    ) -> Result<Login, AccountError> {
        if gamertag.is_empty() || user_id == 0 {
            return Err(AccountError::NoUsername);
        }
        if let Some(login) = Self::xb_locked(&self.inner.read(), user_id)? {
            return Ok(login);
        }

        let mut inner = self.inner.write();
        if let Some(login) = Self::xb_locked(&inner, user_id)? {
            return Ok(login);
        }
        if !allow_create {
            return Err(AccountError::MissingAccount);
        }
        let license = XbLicense {
            gamertag: gamertag.to_string(),
            user_id,
            account_id,
        };
        let mut account = Account {
            account_id: fnv1a32(gamertag.as_bytes()) & 0x7FFF_FFFF,
            ..Default::default()
        };
        account.xb_licenses.insert(user_id, license.clone());
        let shared = Arc::new(RwLock::new(account));
        Self::add_locked(&mut inner, shared.clone())?;
        drop(inner);
        self.save(&shared.read());
        Ok(Login {
            account_was_created: true,
            account: shared,
            credential: Credential::Xb(license),
        })
    }

    // -- BB ----------------------------------------------------------------

    fn bb_locked(
        inner: &Inner,
        username: &str,
        password: Option<&str>,
    ) -> Result<Option<Login>, AccountError> {
        let Some(account) = inner.by_bb_username.get(username) else {
            return Ok(None);
        };
        Self::check_ban(account)?;
        let guard = account.read();
        let license = guard
            .bb_licenses
            .get(username)
            .ok_or(AccountError::MissingAccount)?
            .clone();
        if guard.is_shared() {
            drop(guard);
            let variation = format!("{}:", password.unwrap_or(""));
            return Ok(Some(Self::shared_login(
                account,
                Credential::Bb(license),
                &variation,
            )));
        }
        if let Some(password) = password {
            if license.password != password {
                return Err(AccountError::IncorrectPassword);
            }
        }
        drop(guard);
        Ok(Some(Login {
            account_was_created: false,
            account: account.clone(),
            credential: Credential::Bb(license),
        }))
    }

    pub fn from_bb_credentials(
        &self,
        username: &str,
        password: Option<&str>,
        allow_create: bool,
    ) -> Result<Login, AccountError> {
        if username.is_empty() {
            return Err(AccountError::NoUsername);
        }
        if let Some(login) = Self::bb_locked(&self.inner.read(), username, password)? {
            return Ok(login);
        }

        let mut inner = self.inner.write();
        if let Some(login) = Self::bb_locked(&inner, username, password)? {
            return Ok(login);
        }
        if !allow_create {
            return Err(AccountError::MissingAccount);
        }
        let Some(password) = password else {
            return Err(AccountError::MissingAccount);
        };
        let license = BbLicense {
            username: username.to_string(),
            password: password.to_string(),
        };
        let mut account = Account {
            account_id: fnv1a32(username.as_bytes()) & 0x7FFF_FFFF,
            ..Default::default()
        };
        account
            .bb_licenses
            .insert(username.to_string(), license.clone());
        let shared = Arc::new(RwLock::new(account));
        Self::add_locked(&mut inner, shared.clone())?;
        drop(inner);
        self.save(&shared.read());
        Ok(Login {
            account_was_created: true,
            account: shared,
            credential: Credential::Bb(license),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::flags;

    fn memory_index() -> AccountIndex {
        AccountIndex::new(None).unwrap()
    }

    #[test]
    fn dc_self_creation_uses_serial_as_id() {
        let index = memory_index();
        let login = index
            .from_dc_credentials(0x00AB_CDEF, "12345678", "Alice", true)
            .unwrap();
        assert!(login.account_was_created);
        assert_eq!(login.account.read().account_id, 0x00AB_CDEF);

        // Second login with the same credentials hits the same account.
        let again = index
            .from_dc_credentials(0x00AB_CDEF, "12345678", "Alice", true)
            .unwrap();
        assert!(!again.account_was_created);
        assert_eq!(index.count(), 1);
    }

    #[test]
    fn wrong_access_key_rejected() {
        let index = memory_index();
        index
            .from_dc_credentials(42, "12345678", "x", true)
            .unwrap();
        assert_eq!(
            index.from_dc_credentials(42, "87654321", "x", true),
            Err(AccountError::IncorrectAccessKey)
        );
    }

    #[test]
    fn missing_account_without_create() {
        let index = memory_index();
        assert_eq!(
            index.from_pc_credentials(9, "12345678", "x", false),
            Err(AccountError::MissingAccount)
        );
        assert_eq!(
            index.from_dc_credentials(0, "12345678", "x", true),
            Err(AccountError::NoUsername)
        );
    }

    #[test]
    fn banned_account_rejected() {
        let index = memory_index();
        let login = index
            .from_bb_credentials("foo", Some("bar"), true)
            .unwrap();
        login.account.write().ban_end_time = now_epoch() + 3600;
        assert_eq!(
            index.from_bb_credentials("foo", Some("bar"), false),
            Err(AccountError::AccountBanned)
        );
    }

    #[test]
    fn gc_cannot_self_create_without_password() {
        let index = memory_index();
        assert_eq!(
            index.from_gc_credentials(5, "123456789012", None, "x", true),
            Err(AccountError::MissingAccount)
        );
        let login = index
            .from_gc_credentials(5, "123456789012", Some("hunter2"), "x", true)
            .unwrap();
        assert!(login.account_was_created);
        assert_eq!(
            index.from_gc_credentials(5, "123456789012", Some("wrong"), "x", false),
            Err(AccountError::IncorrectPassword)
        );
        // Without the password step, the access key alone suffices.
        assert!(index
            .from_gc_credentials(5, "123456789012", None, "x", false)
            .is_ok());
    }

    #[test]
    fn hash_derived_ids_are_masked() {
        let index = memory_index();
        let login = index
            .from_bb_credentials("someuser", Some("pw"), true)
            .unwrap();
        assert_eq!(login.account.read().account_id & 0x8000_0000, 0);
        let xb = index
            .from_xb_credentials("SomeTag", 0x1122_3344_5566_7788, 0x99AA, true)
            .unwrap();
        assert_eq!(xb.account.read().account_id & 0x8000_0000, 0);
    }

    #[test]
    fn credential_uniqueness_enforced() {
        let index = memory_index();
        index.from_dc_credentials(7, "12345678", "x", true).unwrap();

        let mut dupe = Account::default();
        dupe.dc_licenses.insert(
            7,
            V1V2License {
                serial_number: 7,
                access_key: "00000000".into(),
            },
        );
        assert_eq!(
            index.add(Arc::new(RwLock::new(dupe))),
            Err(AccountError::CredentialInUse)
        );
    }

    #[test]
    fn id_collision_walks_forward() {
        let index = memory_index();
        index.from_dc_credentials(100, "12345678", "x", true).unwrap();
        // A different serial whose derived id collides manually.
        let mut account = Account {
            account_id: 100,
            ..Default::default()
        };
        account.pc_licenses.insert(
            200,
            V1V2License {
                serial_number: 200,
                access_key: "12345678".into(),
            },
        );
        let shared = Arc::new(RwLock::new(account));
        index.add(shared.clone()).unwrap();
        assert_eq!(shared.read().account_id, 101);
    }

    #[test]
    fn shared_account_mints_stable_derivatives() {
        let index = memory_index();
        let login = index
            .from_dc_credentials(0x0200_0002, "KEY12345", "setup", true)
            .unwrap();
        login.account.write().set_flag(flags::IS_SHARED_ACCOUNT);

        // Any secret is accepted on a shared account.
        let alice = index
            .from_dc_credentials(0x0200_0002, "KEY12345", "Alice", false)
            .unwrap();
        let alice_again = index
            .from_dc_credentials(0x0200_0002, "KEY12345", "Alice", false)
            .unwrap();
        let bob = index
            .from_dc_credentials(0x0200_0002, "WRONGKEY", "Bob", false)
            .unwrap();

        let id_alice = alice.account.read().account_id;
        assert_eq!(id_alice, alice_again.account.read().account_id);
        assert_ne!(id_alice, bob.account.read().account_id);
        assert_eq!(
            id_alice,
            derived_shared_account_id(0x0200_0002, "KEY12345:Alice")
        );
        assert!(alice.account.read().is_temporary);
        // The derivative is not registered in the index.
        assert_eq!(index.count(), 1);
    }

    #[test]
    fn proxy_session_id_parts() {
        let index = memory_index();
        let dc = index
            .from_dc_credentials(0x1234, "12345678", "x", true)
            .unwrap();
        assert_eq!(dc.proxy_session_id(), (0x1234u64 << 32) | 0x1234);

        let bb = index.from_bb_credentials("user", Some("pw"), true).unwrap();
        let expected_low = fnv1a32(b"user") as u64;
        let expected_high = (bb.account.read().account_id as u64) << 32;
        assert_eq!(bb.proxy_session_id(), expected_high | expected_low);
    }

    #[test]
    fn persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let index = AccountIndex::new(Some(dir.path().to_path_buf())).unwrap();
            index
                .from_dc_credentials(0x00AB_CDEF, "12345678", "Alice", true)
                .unwrap();
            assert!(dir.path().join("0011259375.json").exists());
        }
        let reloaded = AccountIndex::new(Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(reloaded.count(), 1);
        assert!(reloaded
            .from_dc_credentials(0x00AB_CDEF, "12345678", "Alice", false)
            .is_ok());

        reloaded.remove(0x00AB_CDEF).unwrap();
        assert!(!dir.path().join("0011259375.json").exists());
    }
}
