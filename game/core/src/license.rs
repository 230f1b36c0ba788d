//! Persistent credentials. Licenses live in a flat file of fixed-size
//! records; the whole store sits behind one RW-lock and the file is
//! rewritten atomically on every mutation.

use crate::wire::{Reader, WireError, Writer};
use bitflags::bitflags;
use hashbrown::HashMap;
use keel::time::timestamp_usecs;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

bitflags! {
    pub struct Privilege: u32 {
        const KICK_USER         = 0x0000_0001;
        const BAN_USER          = 0x0000_0002;
        const SILENCE_USER      = 0x0000_0004;
        const CHANGE_LOBBY_INFO = 0x0000_0008;
        const CHANGE_EVENT      = 0x0000_0010;
        const ANNOUNCE          = 0x0000_0020;
        const FREE_JOIN_GAMES   = 0x0000_0040;
        const UNLOCK_GAMES      = 0x0000_0080;

        const MODERATOR     = 0x0000_0007;
        const ADMINISTRATOR = 0x0000_003F;
        const ROOT          = 0xFFFF_FFFF;
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LoginError {
    NoUsername,
    MissingLicense,
    IncorrectAccessKey,
    IncorrectPassword,
    Banned,
}

impl fmt::Display for LoginError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LoginError::NoUsername => write!(f, "no username given"),
            LoginError::MissingLicense => write!(f, "license not found"),
            LoginError::IncorrectAccessKey => write!(f, "incorrect access key"),
            LoginError::IncorrectPassword => write!(f, "incorrect password"),
            LoginError::Banned => write!(f, "user is banned"),
        }
    }
}

impl std::error::Error for LoginError {}

const USERNAME_WIDTH: usize = 20;
const PASSWORD_WIDTH: usize = 20;
const ACCESS_KEY_WIDTH: usize = 16;
const GC_PASSWORD_WIDTH: usize = 12;

/// One account. The serial number doubles as the guild card number and must
/// be present even for Blue Burst licenses.
#[derive(Debug, Clone, Default)]
pub struct License {
    pub serial_number: u32,
    pub access_key: String,
    pub gc_password: String,
    pub bb_username: String,
    pub bb_password: String,
    pub privileges: u32,
    /// Microseconds since the epoch; zero means not banned.
    pub ban_until: u64,
}

impl License {
    pub fn privileges(&self) -> Privilege {
        Privilege::from_bits_truncate(self.privileges)
    }

    pub fn has_privileges(&self, mask: Privilege) -> bool {
        self.privileges().contains(mask)
    }

    fn is_banned(&self, now: u64) -> bool {
        self.ban_until != 0 && self.ban_until >= now
    }

    fn write_record(&self, writer: &mut Writer) {
        writer.put_ascii(&self.bb_username, USERNAME_WIDTH);
        writer.put_ascii(&self.bb_password, PASSWORD_WIDTH);
        writer.put_u32(self.serial_number);
        writer.put_ascii(&self.access_key, ACCESS_KEY_WIDTH);
        writer.put_ascii(&self.gc_password, GC_PASSWORD_WIDTH);
        writer.put_u32(self.privileges);
        writer.put_u64(self.ban_until);
    }

    fn read_record(reader: &mut Reader) -> Result<License, WireError> {
        Ok(License {
            bb_username: reader.get_ascii(USERNAME_WIDTH)?,
            bb_password: reader.get_ascii(PASSWORD_WIDTH)?,
            serial_number: reader.get_u32()?,
            access_key: reader.get_ascii(ACCESS_KEY_WIDTH)?,
            gc_password: reader.get_ascii(GC_PASSWORD_WIDTH)?,
            privileges: reader.get_u32()?,
            ban_until: reader.get_u64()?,
        })
    }
}

struct Licenses {
    by_serial: HashMap<u32, Arc<License>>,
    by_username: HashMap<String, Arc<License>>,
}

impl Licenses {
    fn insert(&mut self, license: Arc<License>) {
        if !license.bb_username.is_empty() {
            self.by_username.insert(license.bb_username.clone(), license.clone());
        }
        self.by_serial.insert(license.serial_number, license);
    }
}

pub struct LicenseStore {
    path: PathBuf,
    inner: RwLock<Licenses>,
}

impl LicenseStore {
    /// Loads the record file; a missing file is an empty store.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<LicenseStore> {
        let path = path.as_ref().to_path_buf();
        let mut licenses =
            Licenses { by_serial: HashMap::new(), by_username: HashMap::new() };

        match fs::read(&path) {
            Ok(data) => {
                let mut reader = Reader::new(&data);
                while let Ok(license) = License::read_record(&mut reader) {
                    licenses.insert(Arc::new(license));
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }

        Ok(LicenseStore { path, inner: RwLock::new(licenses) })
    }

    /// An unbacked store for tests.
    pub fn ephemeral() -> LicenseStore {
        LicenseStore {
            path: PathBuf::new(),
            inner: RwLock::new(Licenses {
                by_serial: HashMap::new(),
                by_username: HashMap::new(),
            }),
        }
    }

    pub fn count(&self) -> usize {
        self.inner.read().unwrap().by_serial.len()
    }

    /// v1/v2-era verification: serial plus the first eight characters of the
    /// access key.
    pub fn verify_v1(&self, serial_number: u32, access_key: &str) -> Result<Arc<License>, LoginError> {
        self.verify_serial(serial_number, access_key, 8, None)
    }

    pub fn verify_v2(&self, serial_number: u32, access_key: &str) -> Result<Arc<License>, LoginError> {
        self.verify_serial(serial_number, access_key, 8, None)
    }

    /// GC verification: serial, twelve access-key characters, and usually a
    /// password.
    pub fn verify_gc(
        &self,
        serial_number: u32,
        access_key: &str,
        password: Option<&str>,
    ) -> Result<Arc<License>, LoginError> {
        self.verify_serial(serial_number, access_key, 12, password)
    }

    fn verify_serial(
        &self,
        serial_number: u32,
        access_key: &str,
        key_chars: usize,
        password: Option<&str>,
    ) -> Result<Arc<License>, LoginError> {
        let inner = self.inner.read().unwrap();
        let license =
            inner.by_serial.get(&serial_number).ok_or(LoginError::MissingLicense)?;

        let expected: String = license.access_key.chars().take(key_chars).collect();
        let given: String = access_key.chars().take(key_chars).collect();
        if expected != given {
            return Err(LoginError::IncorrectAccessKey);
        }
        if let Some(password) = password {
            if license.gc_password != password {
                return Err(LoginError::IncorrectPassword);
            }
        }
        if license.is_banned(timestamp_usecs()) {
            return Err(LoginError::Banned);
        }
        Ok(license.clone())
    }

    pub fn verify_bb(&self, username: &str, password: &str) -> Result<Arc<License>, LoginError> {
        if username.is_empty() {
            return Err(LoginError::NoUsername);
        }
        let inner = self.inner.read().unwrap();
        let license = inner.by_username.get(username).ok_or(LoginError::MissingLicense)?;
        if license.bb_password != password {
            return Err(LoginError::IncorrectPassword);
        }
        if license.is_banned(timestamp_usecs()) {
            return Err(LoginError::Banned);
        }
        Ok(license.clone())
    }

    /// Sets a ban-expiry timestamp and persists.
    pub fn ban_until(&self, serial_number: u32, end_time: u64) -> Result<(), LoginError> {
        let mut inner = self.inner.write().unwrap();
        let license =
            inner.by_serial.get(&serial_number).cloned().ok_or(LoginError::MissingLicense)?;
        let mut updated = License::clone(&license);
        updated.ban_until = end_time;
        inner.insert(Arc::new(updated));
        self.save(&inner);
        Ok(())
    }

    pub fn add(&self, license: License) {
        let mut inner = self.inner.write().unwrap();
        inner.insert(Arc::new(license));
        self.save(&inner);
    }

    pub fn remove(&self, serial_number: u32) -> Result<(), LoginError> {
        let mut inner = self.inner.write().unwrap();
        let license =
            inner.by_serial.remove(&serial_number).ok_or(LoginError::MissingLicense)?;
        if !license.bb_username.is_empty() {
            inner.by_username.remove(&license.bb_username);
        }
        self.save(&inner);
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<License> {
        let inner = self.inner.read().unwrap();
        let mut all: Vec<License> =
            inner.by_serial.values().map(|l| License::clone(l)).collect();
        all.sort_by_key(|l| l.serial_number);
        all
    }

    /// Rewrites the record file via a temp file and rename, so a crash can
    /// never leave a half-written store.
    fn save(&self, inner: &Licenses) {
        if self.path.as_os_str().is_empty() {
            return;
        }
        let mut serials: Vec<&Arc<License>> = inner.by_serial.values().collect();
        serials.sort_by_key(|l| l.serial_number);

        let mut writer = Writer::new();
        for license in serials {
            license.write_record(&mut writer);
        }

        // The in-memory maps stay authoritative if the write fails; the next
        // mutation retries.
        let tmp_path = self.path.with_extension("tmp");
        let _ = fs::write(&tmp_path, writer.as_slice())
            .and_then(|_| fs::rename(&tmp_path, &self.path));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gc_license() -> License {
        License {
            serial_number: 0x12345678,
            access_key: "abcdefghijkl".to_string(),
            gc_password: "hunter2".to_string(),
            bb_username: "ash".to_string(),
            bb_password: "pallet".to_string(),
            privileges: Privilege::MODERATOR.bits(),
            ban_until: 0,
        }
    }

    #[test]
    fn gc_verification_checks_key_and_password() {
        let store = LicenseStore::ephemeral();
        store.add(gc_license());

        assert!(store.verify_gc(0x12345678, "abcdefghijkl", Some("hunter2")).is_ok());
        assert_eq!(
            store.verify_gc(0x12345678, "abcdefghijkl", Some("wrong")).unwrap_err(),
            LoginError::IncorrectPassword
        );
        assert_eq!(
            store.verify_gc(0x12345678, "zzzzzzzzzzzz", None).unwrap_err(),
            LoginError::IncorrectAccessKey
        );
        assert_eq!(
            store.verify_gc(0x55555555, "abcdefghijkl", None).unwrap_err(),
            LoginError::MissingLicense
        );
    }

    #[test]
    fn v2_verification_only_checks_eight_key_chars() {
        let store = LicenseStore::ephemeral();
        store.add(gc_license());
        assert!(store.verify_v2(0x12345678, "abcdefgh").is_ok());
        assert!(store.verify_v2(0x12345678, "abcdefghDIFFER").is_ok());
        assert_eq!(
            store.verify_v2(0x12345678, "abcdefgX").unwrap_err(),
            LoginError::IncorrectAccessKey
        );
    }

    #[test]
    fn bb_verification_uses_username() {
        let store = LicenseStore::ephemeral();
        store.add(gc_license());
        assert!(store.verify_bb("ash", "pallet").is_ok());
        assert_eq!(store.verify_bb("", "pallet").unwrap_err(), LoginError::NoUsername);
        assert_eq!(
            store.verify_bb("ash", "oak").unwrap_err(),
            LoginError::IncorrectPassword
        );
        assert_eq!(
            store.verify_bb("misty", "pallet").unwrap_err(),
            LoginError::MissingLicense
        );
    }

    #[test]
    fn bans_expire() {
        let store = LicenseStore::ephemeral();
        store.add(gc_license());

        let far_future = timestamp_usecs() + 60_000_000;
        store.ban_until(0x12345678, far_future).unwrap();
        assert_eq!(
            store.verify_bb("ash", "pallet").unwrap_err(),
            LoginError::Banned
        );

        store.ban_until(0x12345678, 1).unwrap();
        assert!(store.verify_bb("ash", "pallet").is_ok());
    }

    #[test]
    fn record_roundtrip_through_the_file_format() {
        let license = gc_license();
        let mut writer = Writer::new();
        license.write_record(&mut writer);
        let data = writer.into_vec();
        assert_eq!(data.len(), 84);

        let decoded = License::read_record(&mut Reader::new(&data)).unwrap();
        assert_eq!(decoded.serial_number, license.serial_number);
        assert_eq!(decoded.access_key, license.access_key);
        assert_eq!(decoded.bb_username, license.bb_username);
        assert_eq!(decoded.privileges, license.privileges);
    }

    #[test]
    fn store_persists_across_reopen() {
        let dir = std::env::temp_dir().join("pioneer-license-test");
        let _ = fs::create_dir_all(&dir);
        let path = dir.join("licenses.psl");
        let _ = fs::remove_file(&path);

        {
            let store = LicenseStore::open(&path).unwrap();
            store.add(gc_license());
        }
        {
            let store = LicenseStore::open(&path).unwrap();
            assert_eq!(store.count(), 1);
            assert!(store.verify_bb("ash", "pallet").is_ok());
        }
        let _ = fs::remove_file(&path);
    }
}
