//! # Encrypted container engine
//!
//! This module owns the on-disk container format and the whole archive
//! lifecycle: `create`, `open`, `add`, `delete`, `extract`, `discard_changes`,
//! `save` and the integrity hash.
//!
//! Container layout (all length fields are little-endian `u64`):
//!
//! ```text
//! [ hash: 32 bytes ]                                  SHA-256 of decrypted canonical content
//! [ header:     len, bytes (plaintext JSON), data_len = 0 ]
//! [ properties: iv, len, bytes (ciphertext JSON), data_len = 0 ]
//! [ record 0..: iv, meta_len, meta ciphertext, data_len, data ciphertext ]
//! ```
//!
//! Mutations are copy-on-write: `add` appends to a scratch file, `delete`
//! only moves index state, and `save` rewrites everything into a fresh file
//! that replaces the original in a single rename at the very end. The
//! original container is never touched before that rename.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::codec;
use crate::crypto::{self, AesCbc, KEY_SIZE};
use crate::error::SafeError;
use crate::index::{self, Entry, FolderTree, ROOT};
use crate::progress::Probe;
use crate::record::{Origin, PropertyMap, Record, PROP_ID, PROP_NAME};

/// Size of the integrity hash stored at offset 0.
pub const HASH_SIZE: usize = 32;

/// Required header field: cipher transform identifier.
pub const HDR_ENCRYPTION: &str = "encryption";
/// Required header field: key algorithm name.
pub const HDR_ALGO: &str = "algo";
/// Required header field: IV byte length, stored as a decimal string.
pub const HDR_IV_LENGTH: &str = "iv length";
/// Required header field: PBKDF2 salt, stored as a JSON byte array.
pub const HDR_SALT: &str = "pbkdf2 salt";
/// Required header field: PBKDF2 iteration count, stored as a decimal string.
pub const HDR_ITERATIONS: &str = "pbkdf2 iteration";
/// Optional header field: human-readable format description.
pub const HDR_PROTOCOL: &str = "protocol description";
/// Optional header field: RFC 3339 creation timestamp.
pub const HDR_CREATED: &str = "created";

const TRANSFORM_AES_CBC: &str = "AES/CBC/PKCS5Padding";
const ALGO_AES: &str = "AES";
const DEFAULT_ITERATIONS: u32 = 50_000;
const PROTOCOL_DESCRIPTION: &str = "strongbox encrypted container v1";

/// Cipher setup recovered from (or written into) the container header.
#[derive(Debug, Clone)]
pub struct CipherParams {
    pub transform: String,
    pub algo: String,
    pub iv_length: usize,
    pub salt: Vec<u8>,
    pub iterations: u32,
}

impl CipherParams {
    /// Validate the required header fields. A missing or malformed field is a
    /// format error, fatal for both `create` and `open`.
    pub fn from_header(header: &PropertyMap) -> Result<Self, SafeError> {
        let transform = header_str(header, HDR_ENCRYPTION)?.to_string();
        let algo = header_str(header, HDR_ALGO)?.to_string();
        let iv_length: usize = header_str(header, HDR_IV_LENGTH)?
            .parse()
            .map_err(|_| SafeError::Format(format!("'{}' is not a number", HDR_IV_LENGTH)))?;
        let iterations: u32 = header_str(header, HDR_ITERATIONS)?
            .parse()
            .map_err(|_| SafeError::Format(format!("'{}' is not a number", HDR_ITERATIONS)))?;
        let salt = header
            .get(HDR_SALT)
            .and_then(Value::as_array)
            .and_then(|arr| {
                arr.iter()
                    .map(|v| v.as_u64().and_then(|n| u8::try_from(n).ok()))
                    .collect::<Option<Vec<u8>>>()
            })
            .ok_or_else(|| SafeError::Format(format!("missing header field '{}'", HDR_SALT)))?;

        if transform != TRANSFORM_AES_CBC {
            return Err(SafeError::Format(format!(
                "unsupported cipher transform '{}'",
                transform
            )));
        }
        if algo != ALGO_AES {
            return Err(SafeError::Format(format!("unsupported key algorithm '{}'", algo)));
        }
        if iv_length != crypto::BLOCK_SIZE {
            return Err(SafeError::Format(format!(
                "IV length {} does not match the AES block size",
                iv_length
            )));
        }
        if iterations == 0 {
            return Err(SafeError::Format("PBKDF2 iteration count must be positive".into()));
        }
        Ok(Self { transform, algo, iv_length, salt, iterations })
    }
}

fn header_str<'a>(header: &'a PropertyMap, key: &str) -> Result<&'a str, SafeError> {
    header
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| SafeError::Format(format!("missing header field '{}'", key)))
}

enum KeySource<'a> {
    Password(&'a str),
    Key([u8; KEY_SIZE]),
}

struct SafeInner {
    path: PathBuf,
    file: File,
    scratch: NamedTempFile,
    key: [u8; KEY_SIZE],
    params: CipherParams,
    /// Header JSON exactly as stored; `save` copies these bytes verbatim so
    /// the integrity hash stays a pure function of content.
    header_bytes: Vec<u8>,
    header: PropertyMap,
    /// Decrypted properties JSON exactly as stored; re-encrypted (never
    /// re-serialized) under a fresh IV on every `save`.
    properties_bytes: Vec<u8>,
    properties: PropertyMap,
    stored_hash: [u8; HASH_SIZE],
    tree: FolderTree,
    committed: HashMap<String, Record>,
    pending_add: HashMap<String, Record>,
    pending_delete: HashMap<String, Record>,
    substitute: Option<char>,
}

/// An open archive session. All operations are serialized behind one mutex,
/// so a `Safe` can be shared across threads without interleaving I/O.
pub struct Safe {
    inner: Mutex<SafeInner>,
}

impl Safe {
    /// Create a new, empty container at `path` and return it opened.
    ///
    /// Fails if the path already exists. `extra_header` entries are stored
    /// alongside the required fields (which they cannot override);
    /// `properties` becomes the encrypted private properties block.
    pub fn create(
        path: impl AsRef<Path>,
        password: &str,
        extra_header: PropertyMap,
        properties: PropertyMap,
    ) -> Result<Safe, SafeError> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| SafeError::io_at(e, path))?;

        let salt = crypto::generate_salt();
        let mut header = PropertyMap::new();
        header.insert(HDR_ENCRYPTION.into(), Value::String(TRANSFORM_AES_CBC.into()));
        header.insert(HDR_ALGO.into(), Value::String(ALGO_AES.into()));
        header.insert(HDR_IV_LENGTH.into(), Value::String(crypto::BLOCK_SIZE.to_string()));
        header.insert(
            HDR_SALT.into(),
            Value::Array(salt.iter().map(|b| Value::from(*b)).collect()),
        );
        header.insert(HDR_ITERATIONS.into(), Value::String(DEFAULT_ITERATIONS.to_string()));
        header.insert(HDR_PROTOCOL.into(), Value::String(PROTOCOL_DESCRIPTION.into()));
        header.insert(HDR_CREATED.into(), Value::String(Utc::now().to_rfc3339()));
        for (k, v) in extra_header {
            header.entry(k).or_insert(v);
        }

        let params = CipherParams::from_header(&header)?;
        let key = crypto::derive_key(password, &params.salt, params.iterations);
        let header_bytes = serde_json::to_vec(&header)?;
        let properties_bytes = serde_json::to_vec(&properties)?;

        file.write_all(&[0u8; HASH_SIZE])?;
        write_u64(&mut file, header_bytes.len() as u64)?;
        file.write_all(&header_bytes)?;
        write_u64(&mut file, 0)?;
        write_properties_block(&mut file, &key, params.iv_length, &properties_bytes)?;
        file.flush()?;

        // The placeholder hash is replaced once the real content is on disk.
        let hash = compute_container_hash(&mut file, &key, params.iv_length, &Probe::new())?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&hash)?;
        file.sync_all()?;
        drop(file);

        debug!(path = %path.display(), "created container");
        Self::open_internal(path, KeySource::Key(key))
    }

    /// Open an existing container. The key is derived from the password via
    /// PBKDF2-HMAC-SHA1 with the salt and iteration count stored in the
    /// header, truncated to a 128-bit AES key.
    pub fn open(path: impl AsRef<Path>, password: &str) -> Result<Safe, SafeError> {
        Self::open_internal(path.as_ref(), KeySource::Password(password))
    }

    fn open_internal(path: &Path, source: KeySource) -> Result<Safe, SafeError> {
        let mut file = File::open(path).map_err(|e| SafeError::io_at(e, path))?;
        let file_len = file.metadata().map_err(|e| SafeError::io_at(e, path))?.len();

        let mut stored_hash = [0u8; HASH_SIZE];
        file.read_exact(&mut stored_hash)?;

        let header_len = read_u64(&mut file)?;
        check_segment(header_len, file_len, "header")?;
        let header_bytes = read_vec(&mut file, header_len)?;
        let header: PropertyMap = serde_json::from_slice(&header_bytes)
            .map_err(|e| SafeError::Format(format!("header is not valid JSON: {}", e)))?;
        expect_zero(read_u64(&mut file)?, "header")?;

        let params = CipherParams::from_header(&header)?;
        let key = match source {
            KeySource::Password(password) => {
                crypto::derive_key(password, &params.salt, params.iterations)
            }
            KeySource::Key(key) => key,
        };

        let iv = read_vec(&mut file, params.iv_length as u64)?;
        let props_len = read_u64(&mut file)?;
        check_segment(props_len, file_len, "properties")?;
        let props_ct = read_vec(&mut file, props_len)?;
        let properties_bytes = crypto::decrypt_all(&key, &iv, &props_ct)?;
        let properties: PropertyMap = serde_json::from_slice(&properties_bytes)
            .map_err(|_| SafeError::Crypto("properties block is not valid JSON (wrong password?)".into()))?;
        expect_zero(read_u64(&mut file)?, "properties")?;

        let mut tree = FolderTree::new();
        let mut committed = HashMap::new();
        loop {
            let offset = file.stream_position()?;
            if offset >= file_len {
                break;
            }
            let iv = read_vec(&mut file, params.iv_length as u64)?;
            let meta_length = read_u64(&mut file)?;
            check_segment(meta_length, file_len, "record metadata")?;
            let meta_offset = file.stream_position()?;
            let meta_ct = read_vec(&mut file, meta_length)?;
            let meta_plain = crypto::decrypt_all(&key, &iv, &meta_ct)?;
            let properties: PropertyMap = serde_json::from_slice(&meta_plain)
                .map_err(|e| SafeError::Format(format!("record metadata is not valid JSON: {}", e)))?;
            let id = properties
                .get(PROP_ID)
                .and_then(Value::as_str)
                .ok_or_else(|| SafeError::Format("record metadata is missing 'id'".into()))?
                .to_string();
            let comparable = index::comparable(&id);
            if committed.contains_key(&comparable) {
                return Err(SafeError::Format(format!("duplicate path '{}' in container", id)));
            }

            let data_length = read_u64(&mut file)?;
            check_segment(data_length, file_len, "record data")?;
            let data_offset = file.stream_position()?;
            let end = data_offset
                .checked_add(data_length)
                .filter(|&end| end <= file_len)
                .ok_or_else(|| SafeError::Format(format!("record '{}' is truncated", id)))?;

            // The payload is not decrypted on open; only its range is recorded.
            tree.mkdir(&id, true)
                .map_err(|e| SafeError::Format(format!("invalid record path '{}': {}", id, e)))?;
            tree.attach(&id)
                .map_err(|e| SafeError::Format(format!("invalid record path '{}': {}", id, e)))?;
            committed.insert(
                comparable,
                Record {
                    path: id,
                    properties,
                    origin: Origin::Container,
                    offset,
                    length: end - offset,
                    meta_offset,
                    meta_length,
                    data_offset,
                    data_length,
                },
            );
            file.seek(SeekFrom::Start(end))?;
        }

        let scratch = NamedTempFile::new().map_err(SafeError::from)?;
        debug!(path = %path.display(), records = committed.len(), "opened container");

        Ok(Safe {
            inner: Mutex::new(SafeInner {
                path: path.to_path_buf(),
                file,
                scratch,
                key,
                params,
                header_bytes,
                header,
                properties_bytes,
                properties,
                stored_hash,
                tree,
                committed,
                pending_add: HashMap::new(),
                pending_delete: HashMap::new(),
                substitute: Some(index::DEFAULT_SUBSTITUTE),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SafeInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Encrypt `reader` into the scratch file as a new pending record.
    /// `properties` must carry `id` (the destination path) and `name`; missing
    /// ancestor directories are created. Returns the sanitized path.
    pub fn add(
        &self,
        properties: PropertyMap,
        reader: &mut dyn Read,
        probe: &Probe,
    ) -> Result<String, SafeError> {
        self.lock().add(properties, reader, probe)
    }

    /// Remove a record from the index. The bytes stay where they are; `save`
    /// simply leaves them behind and `discard_changes` can undo the delete.
    pub fn delete(&self, path: &str) -> Result<(), SafeError> {
        self.lock().delete(path)
    }

    /// Remove a directory. A non-empty directory requires `force`, which
    /// deletes every record underneath it first.
    pub fn delete_folder(&self, path: &str, force: bool) -> Result<(), SafeError> {
        self.lock().delete_folder(path, force)
    }

    /// Create a directory (and any missing ancestors).
    pub fn mkdir(&self, path: &str) -> Result<(), SafeError> {
        self.lock().tree.mkdir(path, false).map(|_| ())
    }

    /// Stream a record's decrypted payload into `out`. Looks in committed
    /// records first, then pending additions. Returns the payload length.
    pub fn extract(
        &self,
        path: &str,
        out: &mut dyn Write,
        probe: &Probe,
    ) -> Result<u64, SafeError> {
        self.lock().extract(path, out, probe)
    }

    /// A record's decrypted metadata map (`id`, `name`, and any user keys).
    pub fn read_metadata(&self, path: &str) -> Result<PropertyMap, SafeError> {
        let inner = self.lock();
        inner.find_record(path).map(|r| r.properties.clone())
    }

    /// Drop every pending addition and undo every pending delete, restoring
    /// the committed-only view. Idempotent; touches no file bytes.
    pub fn discard_changes(&self) -> Result<(), SafeError> {
        self.lock().discard_changes()
    }

    /// Write all surviving records into a brand-new container file, replace
    /// the original atomically and return the freshly re-opened archive.
    ///
    /// Records are copied as raw bytes; each one already carries its own IV,
    /// so nothing is re-encrypted. Until the final rename the original file
    /// is untouched, whatever fails before that.
    pub fn save(self, probe: &Probe) -> Result<Safe, SafeError> {
        let inner = match self.inner.into_inner() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.save(probe)
    }

    /// Recompute the integrity hash over the current container file.
    pub fn compute_hash(&self, probe: &Probe) -> Result<[u8; HASH_SIZE], SafeError> {
        let mut inner = self.lock();
        let SafeInner { ref mut file, ref key, ref params, .. } = *inner;
        compute_container_hash(file, key, params.iv_length, probe)
    }

    /// The hash stored at offset 0 when the container was last written.
    pub fn stored_hash(&self) -> [u8; HASH_SIZE] {
        self.lock().stored_hash
    }

    /// Recompute the hash and compare it with the stored one. A mismatch is
    /// reported as `false`, never as an error; the caller decides.
    pub fn verify(&self, probe: &Probe) -> Result<bool, SafeError> {
        let computed = self.compute_hash(probe)?;
        Ok(computed == self.stored_hash())
    }

    /// Release both file handles. The scratch file is deleted.
    pub fn close(self) {
        drop(self);
    }

    pub fn path(&self) -> PathBuf {
        self.lock().path.clone()
    }

    pub fn header(&self) -> PropertyMap {
        self.lock().header.clone()
    }

    pub fn properties(&self) -> PropertyMap {
        self.lock().properties.clone()
    }

    /// Paths of every record currently visible in the index, in display order.
    pub fn record_paths(&self) -> Vec<String> {
        let inner = self.lock();
        inner.tree.records_under(ROOT)
    }

    pub fn pending_add_paths(&self) -> Vec<String> {
        let inner = self.lock();
        let mut records: Vec<&Record> = inner.pending_add.values().collect();
        records.sort_by_key(|r| r.offset);
        records.iter().map(|r| r.path.clone()).collect()
    }

    pub fn pending_delete_paths(&self) -> Vec<String> {
        let inner = self.lock();
        let mut paths: Vec<String> = inner.pending_delete.values().map(|r| r.path.clone()).collect();
        paths.sort();
        paths
    }

    /// True when any add or delete is pending.
    pub fn is_dirty(&self) -> bool {
        let inner = self.lock();
        !inner.pending_add.is_empty() || !inner.pending_delete.is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.lock().find_record(path).is_ok()
    }

    /// Expand a wildcard pattern against the index; returns matching record
    /// and directory paths, de-duplicated and insertion-ordered.
    pub fn glob(&self, pattern: &str) -> Result<Vec<String>, SafeError> {
        let inner = self.lock();
        let entries = inner.tree.match_glob(pattern, ROOT)?;
        Ok(entries
            .iter()
            .map(|e| match e {
                Entry::Folder(fid) => inner.tree.full_path(*fid),
                Entry::Record(path) => path.clone(),
            })
            .collect())
    }

    /// Configure the substitute used when sanitizing path segments.
    /// `None` deletes forbidden characters instead of replacing them.
    pub fn set_sanitize_substitute(&self, substitute: Option<char>) {
        self.lock().substitute = substitute;
    }
}

impl SafeInner {
    fn add(
        &mut self,
        mut properties: PropertyMap,
        reader: &mut dyn Read,
        probe: &Probe,
    ) -> Result<String, SafeError> {
        let raw_id = properties
            .get(PROP_ID)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SafeError::Validation("metadata is missing 'id'".into()))?
            .to_string();
        if properties
            .get(PROP_NAME)
            .and_then(Value::as_str)
            .map_or(true, str::is_empty)
        {
            return Err(SafeError::Validation("metadata is missing 'name'".into()));
        }

        let mut path = index::sanitize_path(&raw_id, self.substitute);
        if !path.starts_with(index::DELIMITER) {
            path.insert(0, index::DELIMITER);
        }
        let name = index::leaf_name(&path).to_string();
        if name.is_empty() {
            return Err(SafeError::Validation(format!("'{}' has no usable name", raw_id)));
        }

        let comparable = index::comparable(&path);
        if self.committed.contains_key(&comparable) || self.pending_add.contains_key(&comparable) {
            return Err(SafeError::Validation(format!("'{}' already exists in the archive", path)));
        }

        // Ancestors are created on demand, exactly as parse-on-open does.
        self.tree.mkdir(&path, true)?;
        if self.tree.resolve(&path, ROOT).is_some() {
            return Err(SafeError::Validation(format!(
                "'{}' already exists as a directory",
                path
            )));
        }

        // Reserved keys track the sanitized path.
        properties.insert(PROP_ID.into(), Value::String(path.clone()));
        properties.insert(PROP_NAME.into(), Value::String(name));
        let meta_plain = serde_json::to_vec(&properties)?;

        let scratch = self.scratch.as_file_mut();
        let offset = scratch.seek(SeekFrom::End(0))?;
        let iv = crypto::generate_iv(self.params.iv_length);
        scratch.write_all(&iv)?;

        let meta_ct = crypto::encrypt_all(&self.key, &iv, &meta_plain)?;
        write_u64(scratch, meta_ct.len() as u64)?;
        let meta_offset = scratch.stream_position()?;
        scratch.write_all(&meta_ct)?;

        // The data length is backpatched once the ciphertext size is known.
        let data_len_pos = scratch.stream_position()?;
        write_u64(scratch, 0)?;
        let data_offset = data_len_pos + 8;
        let mut cipher = AesCbc::encryptor(&self.key, &iv)?;
        let mut buf = vec![0u8; codec::BUFFER_SIZE];
        let data_length = codec::encrypt(reader, &mut cipher, scratch, &mut buf, probe)?;
        let end = scratch.stream_position()?;
        scratch.seek(SeekFrom::Start(data_len_pos))?;
        write_u64(scratch, data_length)?;
        scratch.seek(SeekFrom::End(0))?;
        scratch.flush()?;

        // The record becomes visible only after its bytes are fully written;
        // a cancellation above leaves orphaned scratch bytes and no entry.
        self.tree.attach(&path)?;
        let record = Record {
            path: path.clone(),
            properties,
            origin: Origin::Scratch,
            offset,
            length: end - offset,
            meta_offset,
            meta_length: meta_ct.len() as u64,
            data_offset,
            data_length,
        };
        self.pending_add.insert(comparable, record);
        Ok(path)
    }

    fn delete(&mut self, path: &str) -> Result<(), SafeError> {
        match self.tree.resolve(path, ROOT) {
            Some(Entry::Record(full)) => {
                let comparable = index::comparable(&full);
                let record = self
                    .pending_add
                    .remove(&comparable)
                    .or_else(|| self.committed.remove(&comparable))
                    .ok_or_else(|| SafeError::NotFound(full.clone()))?;
                self.tree.detach(&full);
                self.pending_delete.insert(comparable, record);
                Ok(())
            }
            Some(Entry::Folder(_)) => {
                Err(SafeError::Validation(format!("'{}' is a directory", path)))
            }
            None => Err(SafeError::NotFound(path.to_string())),
        }
    }

    fn delete_folder(&mut self, path: &str, force: bool) -> Result<(), SafeError> {
        match self.tree.resolve(path, ROOT) {
            Some(Entry::Folder(fid)) => {
                if fid == ROOT {
                    return Err(SafeError::Validation("cannot delete the root directory".into()));
                }
                if !self.tree.is_empty(fid) {
                    if !force {
                        return Err(SafeError::Validation(format!(
                            "directory '{}' is not empty",
                            path
                        )));
                    }
                    for record_path in self.tree.records_under(fid) {
                        self.delete(&record_path)?;
                    }
                }
                let full = self.tree.full_path(fid);
                self.tree.detach(&full);
                Ok(())
            }
            Some(Entry::Record(_)) => {
                Err(SafeError::Validation(format!("'{}' is not a directory", path)))
            }
            None => Err(SafeError::NotFound(path.to_string())),
        }
    }

    fn discard_changes(&mut self) -> Result<(), SafeError> {
        for record in self.pending_add.values() {
            self.tree.detach(&record.path);
        }
        self.pending_add.clear();

        let deleted: Vec<Record> = self.pending_delete.drain().map(|(_, r)| r).collect();
        for record in deleted {
            // A record both added and deleted this session dies with the
            // scratch bytes it lives in.
            if record.origin == Origin::Scratch {
                continue;
            }
            self.tree.mkdir(&record.path, true)?;
            self.tree.attach(&record.path)?;
            self.committed.insert(record.comparable_path(), record);
        }
        Ok(())
    }

    fn find_record(&self, path: &str) -> Result<&Record, SafeError> {
        let full = match self.tree.resolve(path, ROOT) {
            Some(Entry::Record(full)) => full,
            _ => return Err(SafeError::NotFound(path.to_string())),
        };
        let comparable = index::comparable(&full);
        self.committed
            .get(&comparable)
            .or_else(|| self.pending_add.get(&comparable))
            .ok_or_else(|| SafeError::NotFound(path.to_string()))
    }

    fn extract(
        &mut self,
        path: &str,
        out: &mut dyn Write,
        probe: &Probe,
    ) -> Result<u64, SafeError> {
        let record = self.find_record(path)?.clone();
        let source: &mut File = match record.origin {
            Origin::Container => &mut self.file,
            Origin::Scratch => self.scratch.as_file_mut(),
        };
        source.seek(SeekFrom::Start(record.offset))?;
        let iv = read_vec(source, self.params.iv_length as u64)?;
        source.seek(SeekFrom::Start(record.data_offset))?;

        let mut cipher = AesCbc::decryptor(&self.key, &iv)?;
        let mut buf = vec![0u8; codec::BUFFER_SIZE];
        codec::decrypt(source, record.data_length, &mut cipher, out, &mut buf, probe)
    }

    fn save(mut self, probe: &Probe) -> Result<Safe, SafeError> {
        debug!(
            path = %self.path.display(),
            adds = self.pending_add.len(),
            deletes = self.pending_delete.len(),
            "saving container"
        );

        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut staged = NamedTempFile::new_in(&dir).map_err(|e| SafeError::io_at(e, &dir))?;

        {
            let out = staged.as_file_mut();
            out.write_all(&[0u8; HASH_SIZE])?;
            write_u64(out, self.header_bytes.len() as u64)?;
            out.write_all(&self.header_bytes)?;
            write_u64(out, 0)?;
            write_properties_block(out, &self.key, self.params.iv_length, &self.properties_bytes)?;

            // Committed records keep their file order; pending additions
            // follow in the order they were written to the scratch file.
            let mut survivors: Vec<Record> = self.committed.values().cloned().collect();
            survivors.sort_by_key(|r| r.offset);
            let mut added: Vec<Record> = self.pending_add.values().cloned().collect();
            added.sort_by_key(|r| r.offset);

            let mut buf = vec![0u8; codec::BUFFER_SIZE];
            for record in survivors.iter().chain(added.iter()) {
                let source: &mut File = match record.origin {
                    Origin::Container => &mut self.file,
                    Origin::Scratch => self.scratch.as_file_mut(),
                };
                source.seek(SeekFrom::Start(record.offset))?;
                codec::copy_exact(source, out, record.length, &mut buf, probe)?;
            }
            out.flush()?;
        }

        let hash =
            compute_container_hash(staged.as_file_mut(), &self.key, self.params.iv_length, probe)?;
        {
            let out = staged.as_file_mut();
            out.seek(SeekFrom::Start(0))?;
            out.write_all(&hash)?;
            out.sync_all()?;
        }

        // The rename below is the single irreversible step; everything up to
        // here left the original container untouched.
        drop(self.file);
        let path = self.path.clone();
        staged
            .persist(&path)
            .map_err(|e| SafeError::io_at(e.error, &path))?;
        drop(self.scratch);

        debug!(path = %path.display(), "container saved");
        Safe::open_internal(&path, KeySource::Key(self.key))
    }
}

fn write_u64<W: Write + ?Sized>(w: &mut W, value: u64) -> Result<(), SafeError> {
    w.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn read_u64<R: Read + ?Sized>(r: &mut R) -> Result<u64, SafeError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_vec<R: Read + ?Sized>(r: &mut R, len: u64) -> Result<Vec<u8>, SafeError> {
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn expect_zero(value: u64, what: &str) -> Result<(), SafeError> {
    if value != 0 {
        return Err(SafeError::Format(format!(
            "{} block carries unexpected data (length {})",
            what, value
        )));
    }
    Ok(())
}

fn check_segment(len: u64, file_len: u64, what: &str) -> Result<(), SafeError> {
    if len > file_len {
        return Err(SafeError::Format(format!("{} length {} is out of range", what, len)));
    }
    Ok(())
}

fn write_properties_block(
    w: &mut File,
    key: &[u8; KEY_SIZE],
    iv_length: usize,
    plain: &[u8],
) -> Result<(), SafeError> {
    let iv = crypto::generate_iv(iv_length);
    w.write_all(&iv)?;
    let ct = crypto::encrypt_all(key, &iv, plain)?;
    write_u64(w, ct.len() as u64)?;
    w.write_all(&ct)?;
    write_u64(w, 0)?;
    Ok(())
}

/// Feeds decrypted bytes straight into a SHA-256 hasher.
struct HashWriter<'a>(&'a mut Sha256);

impl Write for HashWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// SHA-256 over the decrypted canonical content of a container, in file
/// order: header length + header bytes + its zero data-length, then for the
/// properties block and every record the stored length fields and the
/// decrypted bytes.
///
/// IVs are not part of the hashed material: `save` re-randomizes them, and
/// the hash must stay a pure function of logical content.
fn compute_container_hash(
    file: &mut File,
    key: &[u8; KEY_SIZE],
    iv_length: usize,
    probe: &Probe,
) -> Result<[u8; HASH_SIZE], SafeError> {
    let file_len = file.metadata()?.len();
    file.seek(SeekFrom::Start(HASH_SIZE as u64))?;
    let mut hasher = Sha256::new();

    let header_len = read_u64(file)?;
    check_segment(header_len, file_len, "header")?;
    hasher.update(header_len.to_le_bytes());
    hasher.update(&read_vec(file, header_len)?);
    let zero = read_u64(file)?;
    hasher.update(zero.to_le_bytes());

    let iv = read_vec(file, iv_length as u64)?;
    let props_len = read_u64(file)?;
    check_segment(props_len, file_len, "properties")?;
    hasher.update(props_len.to_le_bytes());
    let props_ct = read_vec(file, props_len)?;
    hasher.update(&crypto::decrypt_all(key, &iv, &props_ct)?);
    let zero = read_u64(file)?;
    hasher.update(zero.to_le_bytes());

    let mut buf = vec![0u8; codec::BUFFER_SIZE];
    loop {
        probe.check()?;
        let pos = file.stream_position()?;
        if pos >= file_len {
            break;
        }
        let iv = read_vec(file, iv_length as u64)?;
        let meta_len = read_u64(file)?;
        check_segment(meta_len, file_len, "record metadata")?;
        hasher.update(meta_len.to_le_bytes());
        let meta_ct = read_vec(file, meta_len)?;
        hasher.update(&crypto::decrypt_all(key, &iv, &meta_ct)?);

        let data_len = read_u64(file)?;
        check_segment(data_len, file_len, "record data")?;
        hasher.update(data_len.to_le_bytes());
        let mut cipher = AesCbc::decryptor(key, &iv)?;
        let mut sink = HashWriter(&mut hasher);
        codec::decrypt(file, data_len, &mut cipher, &mut sink, &mut buf, probe)?;
    }

    Ok(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_header() -> PropertyMap {
        let mut header = PropertyMap::new();
        header.insert(HDR_ENCRYPTION.into(), Value::String(TRANSFORM_AES_CBC.into()));
        header.insert(HDR_ALGO.into(), Value::String(ALGO_AES.into()));
        header.insert(HDR_IV_LENGTH.into(), Value::String("16".into()));
        header.insert(HDR_SALT.into(), Value::Array((0u8..16).map(Value::from).collect()));
        header.insert(HDR_ITERATIONS.into(), Value::String("1000".into()));
        header
    }

    #[test]
    fn cipher_params_parse_a_complete_header() {
        let params = CipherParams::from_header(&minimal_header()).unwrap();
        assert_eq!(params.iv_length, 16);
        assert_eq!(params.iterations, 1000);
        assert_eq!(params.salt, (0u8..16).collect::<Vec<u8>>());
    }

    #[test]
    fn cipher_params_require_every_field() {
        for missing in [HDR_ENCRYPTION, HDR_ALGO, HDR_IV_LENGTH, HDR_SALT, HDR_ITERATIONS] {
            let mut header = minimal_header();
            header.remove(missing);
            let result = CipherParams::from_header(&header);
            assert!(
                matches!(result, Err(SafeError::Format(_))),
                "field '{}' should be required",
                missing
            );
        }
    }

    #[test]
    fn cipher_params_reject_foreign_transforms() {
        let mut header = minimal_header();
        header.insert(HDR_ENCRYPTION.into(), Value::String("DES/ECB/NoPadding".into()));
        assert!(matches!(CipherParams::from_header(&header), Err(SafeError::Format(_))));
    }
}
