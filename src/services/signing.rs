//! Goal-event signing and verification.
//!
//! Prevents tampering between planner, bus, and isolated workers: outbound
//! goal events are signed (RSA-SHA512 over a canonical line serialization,
//! base64-encoded), inbound events are verified against a configurable set
//! of public keys that always includes the published platform key.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ring::rand::SystemRandom;
use ring::signature::{RsaKeyPair, UnparsedPublicKey, RSA_PKCS1_2048_8192_SHA512, RSA_PKCS1_SHA512};
use thiserror::Error;

use crate::domain::models::{GoalEvent, Provenance};

/// The published platform verification key, always part of the key store.
pub const PLATFORM_PUBLIC_KEY: &str = "-----BEGIN RSA PUBLIC KEY-----
MIIBCgKCAQEAikfgoapBy69X8iCVerl1sWIUw1gUFIzQXfD6v91b30tHZFKk6eTG
84X3S1A/9ZT2D4KJfYtu9SYtkzBeCTPmS4hTsmZO4njzRaTwHa7RbEdG+DXQkA5X
OS4+lgwdUNZ5N3w44SCRHELPlV1lC0Rs24HmgvBDZML+l0o5hptlaGLnAasBTYgU
g/BUiLpgwdkJg3uZQXqQDGtl27SUU7ylLYaPhGjPrO3o4GVILvm6BXqFSf3ku8Hm
hf195FQC+jlfoPDRkpsCJ9GtTfEY9SJdslhdYIT2OW7XW1SD6IazxFqxOn/t1HgU
ZV7L40eMV6gQ89bBA1Q/DGzfvVQLN2sJGwIDAQAB
-----END RSA PUBLIC KEY-----
";

/// Signing and verification errors.
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("Failed to load signing key: {0}")]
    KeyLoad(String),

    #[error("Signing failed: {0}")]
    SignFailed(String),
}

/// Why a goal event was rejected by the verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    MissingSignature,
    InvalidSignature,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingSignature => write!(f, "signature was missing"),
            Self::InvalidSignature => write!(f, "signature was invalid"),
        }
    }
}

impl Rejection {
    /// Description recorded on the rejected goal event.
    pub fn description(&self) -> String {
        format!("Rejected because {self}")
    }
}

fn opt(value: Option<&str>) -> &str {
    value.unwrap_or("undefined")
}

fn provenance_entry(p: &Provenance) -> String {
    format!(
        "{}:{}/{}-{}-{}-{}",
        p.registration,
        p.version,
        p.name,
        opt(p.user_id.as_deref()),
        opt(p.channel_id.as_deref()),
        p.ts
    )
}

fn opt_provenance(p: Option<&Provenance>) -> String {
    p.map_or_else(|| "undefined".to_string(), provenance_entry)
}

/// Canonical serialization of a goal event: the exact byte sequence that is
/// signed and verified. Absent fields serialize to `undefined`.
pub fn canonical_form(goal: &GoalEvent) -> String {
    let pre_conditions = goal
        .pre_conditions
        .iter()
        .map(std::string::ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");
    let external_urls = goal.external_urls.join(",");
    let provenance = goal
        .provenance
        .iter()
        .map(provenance_entry)
        .collect::<Vec<_>>()
        .join(",");

    format!(
        "uniqueName:{}\n\
         environment:{}\n\
         goalSetId:{}\n\
         state:{}\n\
         ts:{}\n\
         version:{}\n\
         repo:{}/{}/{}\n\
         sha:{}\n\
         branch:{}\n\
         fulfillment:{}-{}\n\
         preConditions:{}\n\
         data:{}\n\
         url:{}\n\
         externalUrls:{}\n\
         provenance:{}\n\
         retry:{}\n\
         approvalRequired:{}\n\
         approval:{}\n\
         preApprovalRequired:{}\n\
         preApproval:{}",
        goal.unique_name,
        goal.environment,
        goal.goal_set_id,
        goal.state,
        goal.ts,
        goal.version,
        goal.repo.owner,
        goal.repo.name,
        goal.repo.provider_id,
        goal.sha,
        goal.branch,
        goal.fulfillment.name,
        goal.fulfillment.method,
        pre_conditions,
        opt(goal.data.as_deref()),
        opt(goal.url.as_deref()),
        external_urls,
        provenance,
        goal.retry_feasible,
        goal.approval_required,
        opt_provenance(goal.approval.as_ref()),
        goal.pre_approval_required,
        opt_provenance(goal.pre_approval.as_ref()),
    )
}

/// Signs outbound goal events with the registration's private key.
pub struct GoalSigner {
    key_pair: RsaKeyPair,
    rng: SystemRandom,
}

impl GoalSigner {
    /// Load from a PKCS#8 PEM private key.
    pub fn from_pkcs8_pem(pem: &str) -> Result<Self, SigningError> {
        let mut reader = std::io::Cursor::new(pem.as_bytes());
        let mut pkcs8 = None;
        for item in rustls_pemfile::read_all(&mut reader) {
            let item = item.map_err(|e| SigningError::KeyLoad(e.to_string()))?;
            if let rustls_pemfile::Item::Pkcs8Key(der) = item {
                pkcs8 = Some(der.secret_pkcs8_der().to_vec());
                break;
            }
        }
        let der = pkcs8.ok_or_else(|| {
            SigningError::KeyLoad("no PKCS#8 private key found in PEM".to_string())
        })?;
        let key_pair =
            RsaKeyPair::from_pkcs8(&der).map_err(|e| SigningError::KeyLoad(e.to_string()))?;
        Ok(Self {
            key_pair,
            rng: SystemRandom::new(),
        })
    }

    /// Compute and store the signature on the goal event.
    pub fn sign(&self, goal: &mut GoalEvent) -> Result<(), SigningError> {
        let canonical = canonical_form(goal);
        let mut signature = vec![0u8; self.key_pair.public().modulus_len()];
        self.key_pair
            .sign(
                &RSA_PKCS1_SHA512,
                &self.rng,
                canonical.as_bytes(),
                &mut signature,
            )
            .map_err(|e| SigningError::SignFailed(e.to_string()))?;
        goal.signature = Some(BASE64.encode(signature));
        Ok(())
    }

    /// PKCS#1 DER encoding of this signer's public key.
    pub fn public_key_der(&self) -> Vec<u8> {
        use ring::signature::KeyPair;
        self.key_pair.public_key().as_ref().to_vec()
    }
}

/// Verifies inbound goal events against a set of public keys.
pub struct GoalVerifier {
    /// PKCS#1 DER public keys.
    keys: Vec<Vec<u8>>,
}

impl GoalVerifier {
    /// Build a verifier from PKCS#1 PEM public keys. The published platform
    /// key is always included.
    pub fn from_pems(pems: &[String]) -> Result<Self, SigningError> {
        let mut keys = Vec::new();
        for pem in pems {
            let mut decoded = decode_rsa_public_pem(pem)?;
            keys.append(&mut decoded);
        }
        keys.extend(decode_rsa_public_pem(PLATFORM_PUBLIC_KEY)?);
        Ok(Self { keys })
    }

    /// Build a verifier from raw PKCS#1 DER keys (plus the platform key).
    pub fn from_ders(ders: Vec<Vec<u8>>) -> Result<Self, SigningError> {
        let mut keys = ders;
        keys.extend(decode_rsa_public_pem(PLATFORM_PUBLIC_KEY)?);
        Ok(Self { keys })
    }

    /// Verify the signature on a goal event: compute the canonical form and
    /// succeed on the first matching key.
    pub fn verify(&self, goal: &GoalEvent) -> Result<(), Rejection> {
        let Some(signature) = goal.signature.as_deref() else {
            return Err(Rejection::MissingSignature);
        };
        let Ok(signature) = BASE64.decode(signature) else {
            return Err(Rejection::InvalidSignature);
        };
        let canonical = canonical_form(goal);
        for key in &self.keys {
            let public = UnparsedPublicKey::new(&RSA_PKCS1_2048_8192_SHA512, key);
            if public.verify(canonical.as_bytes(), &signature).is_ok() {
                return Ok(());
            }
        }
        Err(Rejection::InvalidSignature)
    }
}

/// Decode every `RSA PUBLIC KEY` block in a PEM document to PKCS#1 DER.
pub fn decode_rsa_public_pem(pem: &str) -> Result<Vec<Vec<u8>>, SigningError> {
    const BEGIN: &str = "-----BEGIN RSA PUBLIC KEY-----";
    const END: &str = "-----END RSA PUBLIC KEY-----";

    let mut keys = Vec::new();
    let mut rest = pem;
    while let Some(start) = rest.find(BEGIN) {
        let after = &rest[start + BEGIN.len()..];
        let Some(end) = after.find(END) else {
            return Err(SigningError::KeyLoad(
                "unterminated RSA PUBLIC KEY block".to_string(),
            ));
        };
        let body: String = after[..end].split_whitespace().collect();
        let der = BASE64
            .decode(body)
            .map_err(|e| SigningError::KeyLoad(format!("invalid PEM base64: {e}")))?;
        keys.push(der);
        rest = &after[end + END.len()..];
    }
    if keys.is_empty() {
        return Err(SigningError::KeyLoad(
            "no RSA PUBLIC KEY block found".to_string(),
        ));
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Fulfillment, GoalRef, GoalState, RepoRef};

    fn fixture(name: &str) -> String {
        let path = format!("{}/tests/fixtures/{name}", env!("CARGO_MANIFEST_DIR"));
        std::fs::read_to_string(path).expect("fixture should exist")
    }

    fn test_goal() -> GoalEvent {
        GoalEvent {
            goal_set_id: "11111111-2222-3333-4444-555555555555".to_string(),
            unique_name: "build".to_string(),
            environment: "0-code".to_string(),
            name: "build".to_string(),
            sha: "abc123".to_string(),
            branch: "main".to_string(),
            repo: RepoRef::new("octo", "widgets", "gh-1"),
            state: GoalState::Requested,
            ts: 1_700_000_000_000,
            version: 1,
            description: "Ready: build".to_string(),
            pre_conditions: vec![GoalRef::new("0-code", "autofix")],
            fulfillment: Fulfillment::sdm("my-sdm"),
            data: None,
            url: None,
            external_urls: vec![],
            provenance: vec![Provenance {
                registration: "my-sdm".to_string(),
                version: "0.1.0".to_string(),
                name: "PlanGoals".to_string(),
                user_id: None,
                channel_id: None,
                ts: 1_700_000_000_000,
            }],
            phase: None,
            retry_feasible: false,
            approval_required: false,
            approval: None,
            pre_approval_required: false,
            pre_approval: None,
            signature: None,
        }
    }

    #[test]
    fn canonical_form_layout() {
        let goal = test_goal();
        let canonical = canonical_form(&goal);
        let lines: Vec<&str> = canonical.lines().collect();
        assert_eq!(lines[0], "uniqueName:build");
        assert_eq!(lines[1], "environment:0-code");
        assert_eq!(lines[2], "goalSetId:11111111-2222-3333-4444-555555555555");
        assert_eq!(lines[3], "state:requested");
        assert_eq!(lines[6], "repo:octo/widgets/gh-1");
        assert_eq!(lines[9], "fulfillment:my-sdm-sdm");
        assert_eq!(lines[10], "preConditions:0-code/autofix");
        assert_eq!(lines[11], "data:undefined");
        assert_eq!(lines[12], "url:undefined");
        assert_eq!(
            lines[14],
            "provenance:my-sdm:0.1.0/PlanGoals-undefined-undefined-1700000000000"
        );
        assert_eq!(lines[15], "retry:false");
        assert_eq!(lines[17], "approval:undefined");
        assert_eq!(lines.len(), 20);
    }

    #[test]
    fn canonical_form_differs_on_signed_fields() {
        let goal = test_goal();
        let base = canonical_form(&goal);

        let mut changed = test_goal();
        changed.sha = "def456".to_string();
        assert_ne!(base, canonical_form(&changed));

        let mut changed = test_goal();
        changed.state = GoalState::InProcess;
        assert_ne!(base, canonical_form(&changed));

        let mut changed = test_goal();
        changed.ts += 1;
        assert_ne!(base, canonical_form(&changed));
    }

    #[test]
    fn sign_then_verify_succeeds() {
        let signer = GoalSigner::from_pkcs8_pem(&fixture("signing-key.pem")).unwrap();
        let verifier = GoalVerifier::from_pems(&[fixture("verify-key.pem")]).unwrap();

        let mut goal = test_goal();
        signer.sign(&mut goal).unwrap();
        assert!(goal.signature.is_some());
        assert!(verifier.verify(&goal).is_ok());
    }

    #[test]
    fn verify_uses_first_matching_key() {
        let signer = GoalSigner::from_pkcs8_pem(&fixture("signing-key.pem")).unwrap();
        // Wrong key first, right key second.
        let verifier = GoalVerifier::from_pems(&[
            fixture("other-verify-key.pem"),
            fixture("verify-key.pem"),
        ])
        .unwrap();

        let mut goal = test_goal();
        signer.sign(&mut goal).unwrap();
        assert!(verifier.verify(&goal).is_ok());
    }

    #[test]
    fn tampered_goal_fails_verification() {
        let signer = GoalSigner::from_pkcs8_pem(&fixture("signing-key.pem")).unwrap();
        let verifier = GoalVerifier::from_pems(&[fixture("verify-key.pem")]).unwrap();

        let mut goal = test_goal();
        signer.sign(&mut goal).unwrap();
        goal.sha = "tampered".to_string();
        assert_eq!(verifier.verify(&goal), Err(Rejection::InvalidSignature));
    }

    #[test]
    fn missing_signature_is_rejected() {
        let verifier = GoalVerifier::from_pems(&[fixture("verify-key.pem")]).unwrap();
        let goal = test_goal();
        assert_eq!(verifier.verify(&goal), Err(Rejection::MissingSignature));
        assert_eq!(
            Rejection::MissingSignature.description(),
            "Rejected because signature was missing"
        );
    }

    #[test]
    fn wrong_key_rejects() {
        let signer = GoalSigner::from_pkcs8_pem(&fixture("signing-key.pem")).unwrap();
        let verifier = GoalVerifier::from_pems(&[fixture("other-verify-key.pem")]).unwrap();

        let mut goal = test_goal();
        signer.sign(&mut goal).unwrap();
        assert_eq!(verifier.verify(&goal), Err(Rejection::InvalidSignature));
    }

    #[test]
    fn signer_exposes_its_public_key() {
        let signer = GoalSigner::from_pkcs8_pem(&fixture("signing-key.pem")).unwrap();
        let verifier = GoalVerifier::from_ders(vec![signer.public_key_der()]).unwrap();

        let mut goal = test_goal();
        signer.sign(&mut goal).unwrap();
        assert!(verifier.verify(&goal).is_ok());
    }
}
