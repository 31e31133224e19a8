//! AWS ACM certificate facts module.
//!
//! Gathers facts about ACM certificates. Read-only: never reports `changed`.
//!
//! ## Parameters
//!
//! | Parameter | Required | Description |
//! |-----------|----------|-------------|
//! | `certificate_statuses` | No | Statuses to filter the listing by (e.g. `ISSUED`) |
//! | `region` | No | AWS region (default: from environment/config) |
//!
//! ## Example
//!
//! ```yaml
//! - name: Collect issued certificates
//!   aws_acm_facts:
//!     region: us-east-1
//!     certificate_statuses: ['ISSUED']
//!   register: acm
//! ```

use crate::modules::{
    Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult,
    ParallelizationHint, ParamExt,
};
use aws_config::BehaviorVersion;
use aws_sdk_acm::types::{CertificateStatus, CertificateSummary};
use serde::Serialize;

/// Statuses the ACM API accepts as listing filters
const VALID_CERTIFICATE_STATUSES: &[&str] = &[
    "PENDING_VALIDATION",
    "ISSUED",
    "INACTIVE",
    "EXPIRED",
    "VALIDATION_TIMED_OUT",
    "REVOKED",
    "FAILED",
];

/// Flattened certificate record returned in module results
#[derive(Debug, Clone, Serialize)]
pub struct CertificateRecord {
    pub arn: String,
    pub domain_name: String,
}

impl From<&CertificateSummary> for CertificateRecord {
    fn from(summary: &CertificateSummary) -> Self {
        Self {
            arn: summary.certificate_arn().unwrap_or_default().to_string(),
            domain_name: summary.domain_name().unwrap_or_default().to_string(),
        }
    }
}

fn parse_statuses(params: &ModuleParams) -> ModuleResult<Vec<CertificateStatus>> {
    let requested = params
        .get_vec_string("certificate_statuses")?
        .unwrap_or_default();

    let mut statuses = Vec::with_capacity(requested.len());
    for status in requested {
        let status = status.to_uppercase();
        if !VALID_CERTIFICATE_STATUSES.contains(&status.as_str()) {
            return Err(ModuleError::InvalidParameter(format!(
                "Invalid certificate status '{}'. Valid statuses: {}",
                status,
                VALID_CERTIFICATE_STATUSES.join(", ")
            )));
        }
        statuses.push(CertificateStatus::from(status.as_str()));
    }
    Ok(statuses)
}

/// AWS ACM certificate facts module
pub struct AcmFactsModule;

impl AcmFactsModule {
    async fn create_client(region: Option<&str>) -> aws_sdk_acm::Client {
        let config = if let Some(region_str) = region {
            aws_config::defaults(BehaviorVersion::latest())
                .region(aws_sdk_acm::config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::defaults(BehaviorVersion::latest()).load().await
        };
        aws_sdk_acm::Client::new(&config)
    }

    async fn execute_async(&self, params: &ModuleParams) -> ModuleResult<ModuleOutput> {
        let statuses = parse_statuses(params)?;
        let region = params.get_string("region")?;

        let client = Self::create_client(region.as_deref()).await;

        let mut request = client.list_certificates();
        if !statuses.is_empty() {
            request = request.set_certificate_statuses(Some(statuses));
        }

        let resp = request
            .send()
            .await
            .map_err(|e| ModuleError::ExecutionFailed(format!("Failed to list certificates: {}", e)))?;

        let certificates: Vec<CertificateRecord> = resp
            .certificate_summary_list()
            .iter()
            .map(CertificateRecord::from)
            .collect();

        tracing::debug!(count = certificates.len(), "listed ACM certificates");

        Ok(
            ModuleOutput::ok(format!("{} certificate(s)", certificates.len())).with_data(
                "certificates",
                serde_json::to_value(&certificates)
                    .map_err(|e| ModuleError::ExecutionFailed(e.to_string()))?,
            ),
        )
    }
}

impl Module for AcmFactsModule {
    fn name(&self) -> &'static str {
        "aws_acm_facts"
    }

    fn description(&self) -> &'static str {
        "Gather facts about AWS ACM certificates"
    }

    fn parallelization_hint(&self) -> ParallelizationHint {
        ParallelizationHint::RateLimited {
            requests_per_second: 10,
        }
    }

    fn execute(
        &self,
        params: &ModuleParams,
        _context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| ModuleError::ExecutionFailed("No tokio runtime available".to_string()))?;

        let params = params.clone();
        let module = self;

        std::thread::scope(|s| {
            s.spawn(|| handle.block_on(module.execute_async(&params)))
                .join()
                .unwrap()
        })
    }

    // Read-only; check mode is a plain passthrough
    fn check(&self, params: &ModuleParams, context: &ModuleContext) -> ModuleResult<ModuleOutput> {
        self.execute(params, context)
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        parse_statuses(params).map(|_| ())
    }
}
