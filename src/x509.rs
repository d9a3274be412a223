// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! Parse X.509 certificates without shelling out to openssl.

use crate::error::{Error, Result};
use std::path::Path;
use x509_parser::prelude::*;

#[derive(Debug, Clone)]
pub struct CertInfo {
    pub not_after_timestamp: i64,
    pub not_before_timestamp: i64,
    pub common_name: Option<String>,
    pub is_ca: bool,
}

impl CertInfo {
    pub fn days_remaining(&self) -> i64 {
        let now = ::time::OffsetDateTime::now_utc();
        match ::time::OffsetDateTime::from_unix_timestamp(self.not_after_timestamp) {
            Ok(expiry) => (expiry - now).whole_days(),
            Err(_) => -1, // Treat invalid timestamps as expired
        }
    }

    pub fn is_expired(&self) -> bool {
        self.days_remaining() < 0
    }
}

pub fn parse_cert_file(path: &Path) -> Result<CertInfo> {
    let pem_data = std::fs::read_to_string(path).map_err(|e| Error::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;
    parse_cert_pem(&pem_data)
}

pub fn parse_cert_pem(pem_str: &str) -> Result<CertInfo> {
    let pem = ::pem::parse(pem_str)
        .map_err(|e| Error::CertParse(format!("Failed to parse PEM: {}", e)))?;

    if pem.tag() != "CERTIFICATE" {
        return Err(Error::CertParse(format!(
            "Expected CERTIFICATE, got {}",
            pem.tag()
        )));
    }

    let (_, cert) = X509Certificate::from_der(pem.contents())
        .map_err(|e| Error::CertParse(format!("Invalid X.509: {}", e)))?;

    let not_before_timestamp = cert.validity().not_before.timestamp();
    let not_after_timestamp = cert.validity().not_after.timestamp();

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(String::from);

    let mut is_ca = false;
    for ext in cert.extensions() {
        if let ParsedExtension::BasicConstraints(bc) = ext.parsed_extension() {
            is_ca = bc.ca;
        }
    }

    Ok(CertInfo {
        not_after_timestamp,
        not_before_timestamp,
        common_name,
        is_ca,
    })
}
