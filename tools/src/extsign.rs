//! External signer adapter: when a PEM key and a signer program are both
//! supplied, each signature is produced by a blocking child-process call.
//! The to-be-signed bytes are streamed to the child's stdin and the raw
//! signature is read back from its stdout, so no temporary files exist to
//! leak. argv is `<program> <pem_path> <digest_name>`.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use vbsign_api::{Algorithm, Error, Signer};

pub struct ExternalSigner {
    program: PathBuf,
    pem: PathBuf,
    algorithm: Algorithm,
}

impl ExternalSigner {
    pub fn new(program: PathBuf, pem: PathBuf, algorithm: Algorithm) -> ExternalSigner {
        ExternalSigner { program, pem, algorithm }
    }
}

impl Signer for ExternalSigner {
    fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let mut child = Command::new(&self.program)
            .arg(&self.pem)
            .arg(self.algorithm.digest_name())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| {
                Error::ExternalSignerFailed(format!("{}: {}", self.program.display(), e))
            })?;

        // the child cannot emit a signature before it has consumed all of
        // the input, so write-then-read cannot deadlock
        {
            let mut stdin = child.stdin.take().ok_or_else(|| {
                Error::ExternalSignerFailed("child stdin unavailable".to_string())
            })?;
            stdin
                .write_all(data)
                .map_err(|e| Error::ExternalSignerFailed(format!("writing input: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| Error::ExternalSignerFailed(format!("waiting for child: {}", e)))?;
        if !output.status.success() {
            return Err(Error::ExternalSignerFailed(format!(
                "{} exited with {}",
                self.program.display(),
                output.status
            )));
        }
        if output.stdout.len() != self.algorithm.sig_bytes() {
            return Err(Error::ExternalSignerFailed(format!(
                "expected a {}-byte signature, got {}",
                self.algorithm.sig_bytes(),
                output.stdout.len()
            )));
        }
        Ok(output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{scratch_dir, test_private_key};
    use std::os::unix::fs::PermissionsExt;

    fn write_script(dir: &std::path::Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn external_signature_verifies_like_local() {
        let dir = scratch_dir("extsign-ok");
        let key = test_private_key(Algorithm::Rsa1024Sha256);
        let data = b"external signer equivalence body";

        // stand-in for a signing service: returns the canned signature the
        // in-process path produced for the same input
        let local_sig = key.sign(data).unwrap();
        let sig_path = dir.join("sig.bin");
        std::fs::write(&sig_path, &local_sig).unwrap();
        let script = write_script(
            &dir,
            "signer.sh",
            &format!("cat > /dev/null\ncat '{}'", sig_path.display()),
        );

        let external =
            ExternalSigner::new(script, dir.join("unused.pem"), Algorithm::Rsa1024Sha256);
        let sig = external.sign(data).unwrap();
        assert_eq!(sig, local_sig);
        key.public_key(1).unwrap().verify(data, &sig).unwrap();
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn nonzero_exit_is_reported() {
        let dir = scratch_dir("extsign-fail");
        let script = write_script(&dir, "signer.sh", "cat > /dev/null\nexit 3");
        let external =
            ExternalSigner::new(script, dir.join("unused.pem"), Algorithm::Rsa1024Sha256);
        assert!(matches!(
            external.sign(b"data"),
            Err(Error::ExternalSignerFailed(_))
        ));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn short_signature_is_rejected() {
        let dir = scratch_dir("extsign-short");
        let script = write_script(&dir, "signer.sh", "cat > /dev/null\nprintf xx");
        let external =
            ExternalSigner::new(script, dir.join("unused.pem"), Algorithm::Rsa1024Sha256);
        assert!(matches!(
            external.sign(b"data"),
            Err(Error::ExternalSignerFailed(_))
        ));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
