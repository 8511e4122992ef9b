//! Client key and certificate kept in the agent's configuration directory.

use std::path::{Path, PathBuf};

use node_agent_core::{Crypto, CryptoError};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

/// Private key, created on first use.
pub const PRIVATE_KEY_FILE: &str = "private.pem";

/// Certificate issued by the manager after registration.
pub const CERTIFICATE_FILE: &str = "self.crt";

/// Manager's certificate authority.
pub const AUTHORITY_FILE: &str = "authority.crt";

/// [`Crypto`] backed by PEM files in one directory.
#[derive(Debug, Clone)]
pub struct FileCrypto {
    dir: PathBuf,
}

impl FileCrypto {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn existing(&self, name: &str) -> Option<PathBuf> {
        let path = self.dir.join(name);
        path.is_file().then_some(path)
    }

    /// CA certificate, if the manager's authority has been installed.
    #[must_use]
    pub fn authority_file(&self) -> Option<PathBuf> {
        self.existing(AUTHORITY_FILE)
    }

    /// Certificate and key, if both are present.
    #[must_use]
    pub fn identity(&self) -> Option<(PathBuf, PathBuf)> {
        self.certificate_file().zip(self.private_key_file())
    }

    fn load_or_create_key(&self) -> Result<KeyPair, CryptoError> {
        let path = self.dir.join(PRIVATE_KEY_FILE);
        if path.is_file() {
            let pem = std::fs::read_to_string(&path)?;
            return KeyPair::from_pem(&pem).map_err(|e| {
                CryptoError::KeyGeneration(format!("Invalid key in {}: {e}", path.display()))
            });
        }

        tracing::info!(path = %path.display(), "Generating private key");
        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| CryptoError::KeyGeneration(format!("Failed to generate key pair: {e}")))?;
        std::fs::create_dir_all(&self.dir)?;
        write_private(&path, &key_pair.serialize_pem())?;
        Ok(key_pair)
    }
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &str) -> std::io::Result<()> {
    use std::{io::Write, os::unix::fs::OpenOptionsExt};

    std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?
        .write_all(contents.as_bytes())
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &str) -> std::io::Result<()> {
    std::fs::write(path, contents)
}

impl Crypto for FileCrypto {
    fn certificate_file(&self) -> Option<PathBuf> {
        self.existing(CERTIFICATE_FILE)
    }

    fn private_key_file(&self) -> Option<PathBuf> {
        self.existing(PRIVATE_KEY_FILE)
    }

    fn generate_csr(&self, fqdn: &str) -> Result<String, CryptoError> {
        let key_pair = self.load_or_create_key()?;

        let mut params = CertificateParams::default();
        let mut subject = DistinguishedName::new();
        subject.push(DnType::CommonName, fqdn);
        params.distinguished_name = subject;

        params
            .serialize_request(&key_pair)
            .and_then(|csr| csr.pem())
            .map_err(|e| CryptoError::KeyGeneration(format!("Failed to build CSR: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_csr_creates_key_once() {
        let dir = TempDir::new().unwrap();
        let crypto = FileCrypto::new(dir.path().join("agent"));
        assert!(crypto.private_key_file().is_none());

        let csr = crypto.generate_csr("node1.example.com").unwrap();
        assert!(csr.starts_with("-----BEGIN CERTIFICATE REQUEST-----"));

        let key = crypto.private_key_file().unwrap();
        let before = std::fs::read_to_string(&key).unwrap();
        crypto.generate_csr("node1.example.com").unwrap();
        assert_eq!(std::fs::read_to_string(&key).unwrap(), before);
    }

    #[test]
    fn test_identity_requires_certificate() {
        let dir = TempDir::new().unwrap();
        let crypto = FileCrypto::new(dir.path());
        crypto.generate_csr("node1").unwrap();
        assert!(crypto.identity().is_none());

        std::fs::write(dir.path().join(CERTIFICATE_FILE), "cert").unwrap();
        assert_eq!(
            crypto.identity(),
            Some((
                dir.path().join(CERTIFICATE_FILE),
                dir.path().join(PRIVATE_KEY_FILE)
            ))
        );
    }

    #[test]
    fn test_corrupt_key_is_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(PRIVATE_KEY_FILE), "not a key").unwrap();
        assert!(matches!(
            FileCrypto::new(dir.path()).generate_csr("node1"),
            Err(CryptoError::KeyGeneration(_))
        ));
    }
}
