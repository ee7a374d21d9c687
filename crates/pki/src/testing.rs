//! Throwaway certificate authority and a scripted authority client for tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair, SerialNumber,
};
use sidecar_types::{Result, RotationError, Serial};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::authority::{CertificateAuthority, IssueRequest, IssuedBundle};

/// PEM fields as an authority would return them.
#[derive(Debug, Clone)]
pub struct IssuedPem {
    pub certificate: String,
    pub private_key: String,
}

/// Self-signed CA that signs leaf certificates on demand.
pub struct TestCa {
    certificate: Certificate,
    key: KeyPair,
}

impl TestCa {
    pub fn new(common_name: &str) -> Self {
        let key = KeyPair::generate().expect("generate CA key");
        let mut params = CertificateParams::new(Vec::<String>::new()).expect("CA params");
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let certificate = params.self_signed(&key).expect("self-sign CA");

        Self { certificate, key }
    }

    pub fn certificate_pem(&self) -> String {
        self.certificate.pem()
    }

    /// Sign a leaf certificate for `common_name` with the given SANs.
    pub fn issue_pem(&self, common_name: &str, alt_names: &[&str]) -> IssuedPem {
        self.issue_pem_with_serial(common_name, alt_names, None)
    }

    fn issue_pem_with_serial(
        &self,
        common_name: &str,
        alt_names: &[&str],
        serial: Option<&[u8]>,
    ) -> IssuedPem {
        let key = KeyPair::generate().expect("generate leaf key");
        let sans: Vec<String> = alt_names.iter().map(|s| s.to_string()).collect();
        let mut params = CertificateParams::new(sans).expect("leaf params");
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        if let Some(serial) = serial {
            params.serial_number = Some(SerialNumber::from(serial.to_vec()));
        }
        let certificate = params
            .signed_by(&key, &self.certificate, &self.key)
            .expect("sign leaf");

        IssuedPem {
            certificate: certificate.pem(),
            private_key: key.serialize_pem(),
        }
    }

    /// Issue a ready-to-install bundle tagged with `serial`.
    pub fn issue_bundle(&self, common_name: &str, alt_names: &[&str], serial: &str) -> IssuedBundle {
        let issued = self.issue_pem_with_serial(common_name, alt_names, Some(serial.as_bytes()));
        IssuedBundle::from_pem(
            &issued.certificate,
            &issued.private_key,
            &self.certificate_pem(),
            Serial::from(serial),
        )
        .expect("assemble bundle")
    }
}

/// Authority whose issue outcomes are scripted in advance.
///
/// Unscripted issues succeed with serials `S1`, `S2`, ... numbered by call.
pub struct ScriptedAuthority {
    ca: TestCa,
    script: Mutex<VecDeque<Result<String>>>,
    issue_requests: Mutex<Vec<IssueRequest>>,
    revoked: Mutex<Vec<Serial>>,
    failing_revocations: Mutex<HashSet<Serial>>,
    failing_tidy: Mutex<bool>,
    tidy_calls: Mutex<usize>,
    issue_delay: Mutex<Option<Duration>>,
    issues_in_flight: AtomicUsize,
    max_issues_in_flight: AtomicUsize,
}

impl Default for ScriptedAuthority {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedAuthority {
    pub fn new() -> Self {
        Self::with_ca(TestCa::new("Scripted Authority CA"))
    }

    pub fn with_ca(ca: TestCa) -> Self {
        Self {
            ca,
            script: Mutex::new(VecDeque::new()),
            issue_requests: Mutex::new(Vec::new()),
            revoked: Mutex::new(Vec::new()),
            failing_revocations: Mutex::new(HashSet::new()),
            failing_tidy: Mutex::new(false),
            tidy_calls: Mutex::new(0),
            issue_delay: Mutex::new(None),
            issues_in_flight: AtomicUsize::new(0),
            max_issues_in_flight: AtomicUsize::new(0),
        }
    }

    /// Queue the serial returned by a future issue.
    pub fn push_serial(&self, serial: &str) {
        self.script.lock().unwrap().push_back(Ok(serial.to_string()));
    }

    /// Queue a failure for a future issue.
    pub fn push_failure(&self, error: RotationError) {
        self.script.lock().unwrap().push_back(Err(error));
    }

    pub fn fail_revocation_of(&self, serial: &str) {
        self.failing_revocations
            .lock()
            .unwrap()
            .insert(Serial::from(serial));
    }

    /// Hold every subsequent issue open for `delay` before answering.
    pub fn delay_issues(&self, delay: Duration) {
        *self.issue_delay.lock().unwrap() = Some(delay);
    }

    /// Most issue calls ever observed running at the same time.
    pub fn max_concurrent_issues(&self) -> usize {
        self.max_issues_in_flight.load(Ordering::SeqCst)
    }

    pub fn fail_tidy(&self) {
        *self.failing_tidy.lock().unwrap() = true;
    }

    pub fn issue_count(&self) -> usize {
        self.issue_requests.lock().unwrap().len()
    }

    pub fn issue_requests(&self) -> Vec<IssueRequest> {
        self.issue_requests.lock().unwrap().clone()
    }

    /// Serials passed to `revoke`, successful or not, in call order.
    pub fn revoked(&self) -> Vec<Serial> {
        self.revoked.lock().unwrap().clone()
    }

    pub fn tidy_calls(&self) -> usize {
        *self.tidy_calls.lock().unwrap()
    }
}

impl ScriptedAuthority {
    fn scripted_issue(&self, request: &IssueRequest) -> Result<IssuedBundle> {
        let call = {
            let mut requests = self.issue_requests.lock().unwrap();
            requests.push(request.clone());
            requests.len()
        };
        let scripted = self.script.lock().unwrap().pop_front();
        let serial = match scripted {
            Some(Ok(serial)) => serial,
            Some(Err(error)) => return Err(error),
            None => format!("S{}", call),
        };

        let alt_names: Vec<&str> = request.alt_names.iter().map(String::as_str).collect();
        Ok(self
            .ca
            .issue_bundle(&request.common_name, &alt_names, &serial))
    }
}

#[async_trait]
impl CertificateAuthority for ScriptedAuthority {
    async fn issue(&self, request: &IssueRequest) -> Result<IssuedBundle> {
        let in_flight = self.issues_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_issues_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        let delay = *self.issue_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let result = self.scripted_issue(request);
        self.issues_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn revoke(&self, serial: &Serial) -> Result<DateTime<Utc>> {
        self.revoked.lock().unwrap().push(serial.clone());
        if self.failing_revocations.lock().unwrap().contains(serial) {
            return Err(RotationError::Revocation {
                serial: serial.clone(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(Utc::now())
    }

    async fn tidy(&self) -> Result<()> {
        *self.tidy_calls.lock().unwrap() += 1;
        if *self.failing_tidy.lock().unwrap() {
            return Err(RotationError::Tidy("tidy already running".to_string()));
        }
        Ok(())
    }
}
