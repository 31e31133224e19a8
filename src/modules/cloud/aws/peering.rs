//! AWS VPC peering connection module.
//!
//! Reconciles VPC peering connections toward a desired state: queries AWS for
//! existing connections between a source and peer VPC, classifies them by
//! status, and issues the minimal set of create/accept/reject/delete calls to
//! converge. Re-running the same request is safe; a request whose state is
//! already satisfied reports `changed=false`.
//!
//! ## Parameters
//!
//! | Parameter | Required | Description |
//! |-----------|----------|-------------|
//! | `name` | No | Name to tag a created connection with, and to filter matches by |
//! | `source_vpc` | Yes* | VPC ID, CIDR block, or name tag of the requesting VPC (*all states except `list`) |
//! | `peer_vpc` | Yes* | VPC ID, CIDR block, or name tag of the accepting VPC (alias: `dest_vpc`) |
//! | `peer_owner_id` | No | Account ID owning the accepting VPC, if different from the caller's |
//! | `state` | No | Desired state: present, active, pending, absent, list (default: present) |
//! | `force_accept` | No | Accept every pending connection seen, regardless of ownership (default: false) |
//! | `ignore_rejection` | No | Re-create connections even when all prior matches were rejected (default: false) |
//! | `always_delete` | No | On removal, delete pending-acceptance connections instead of rejecting them (default: false) |
//! | `wait_timeout` | No | Seconds to wait for a created connection to settle (default: 300) |
//! | `region` | No | AWS region (default: from environment/config) |
//!
//! Source and peer VPCs may be given as a VPC ID, a CIDR block, or a Name
//! tag. An identifier matching more than one VPC aborts the operation; use
//! something more specific (the VPC ID).
//!
//! A connection pending acceptance is only accepted automatically when the
//! accepting side belongs to the caller's account; `force_accept` skips that
//! check.
//!
//! ## Example
//!
//! ```yaml
//! - name: Peer the app VPC with the bastion VPC
//!   aws_vpc_peering:
//!     name: app-to-bastion
//!     source_vpc: app
//!     peer_vpc: 10.20.0.0/16
//!     region: us-east-1
//!     state: present
//!
//! - name: Request peering into another account
//!   aws_vpc_peering:
//!     source_vpc: 10.0.0.0/16
//!     peer_vpc: vpc-01234567
//!     peer_owner_id: "012345678901"
//!     state: pending
//!
//! - name: Tear down any peering between the two subnets
//!   aws_vpc_peering:
//!     source_vpc: 10.10.1.0/24
//!     peer_vpc: 10.10.2.0/24
//!     state: absent
//! ```

use crate::modules::{
    Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult,
    ParallelizationHint, ParamExt,
};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_ec2::error::ProvideErrorMetadata;
use aws_sdk_ec2::types::{Filter, Tag, Vpc, VpcPeeringConnection as SdkPeeringConnection,
    VpcPeeringConnectionVpcInfo};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Cached regex recognizing CIDR-shaped identifiers (e.g. `10.0.0.0/16`)
static CIDR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{1,3}\.){3}\d{1,3}/\d{1,2}$").expect("Invalid CIDR regex"));

/// Seconds between polls of a connection's status while waiting
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// States a freshly created connection is allowed to settle into
const CREATE_WAIT_STATES: &[PeeringStatus] =
    &[PeeringStatus::PendingAcceptance, PeeringStatus::Active];

/// Returns whether the given identifier looks like a CIDR block specification.
pub fn is_cidr_format(identifier: &str) -> bool {
    CIDR_RE.is_match(identifier)
}

/// Errors from the VPC peering subsystem
#[derive(Error, Debug)]
pub enum PeeringError {
    /// An identifier matched more than one VPC at a single resolution stage
    #[error("More than one VPC found for \"{0}\"")]
    AmbiguousResource(String),

    /// A required identifier matched no VPC at any resolution stage
    #[error("No VPC found for identifier \"{0}\"")]
    ResourceNotFound(String),

    /// The vendor API failed; not retried by this layer
    #[error("AWS API error: {0}")]
    RemoteApi(String),

    /// Missing or inconsistent request parameters, caught before any mutation
    #[error("{0}")]
    Validation(String),

    /// A created connection never reached an acceptable state in time
    #[error("Timed out after {timeout_secs}s waiting for peering connection {connection_id}")]
    WaitTimeout {
        connection_id: String,
        timeout_secs: u64,
    },
}

impl From<PeeringError> for ModuleError {
    fn from(err: PeeringError) -> Self {
        match err {
            PeeringError::Validation(msg) => ModuleError::InvalidParameter(msg),
            other => ModuleError::ExecutionFailed(other.to_string()),
        }
    }
}

/// Status of a VPC peering connection as reported by the API.
///
/// The API reports free-form strings; anything outside the known set parses
/// into [`PeeringStatus::Unknown`], which is never classified as valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeeringStatus {
    Active,
    InitiatingRequest,
    PendingAcceptance,
    Provisioning,
    Rejected,
    Failed,
    Deleted,
    Unknown(String),
}

impl PeeringStatus {
    pub fn from_api_code(code: &str) -> Self {
        match code {
            "active" => Self::Active,
            "initiating-request" => Self::InitiatingRequest,
            "pending-acceptance" => Self::PendingAcceptance,
            "provisioning" => Self::Provisioning,
            "rejected" => Self::Rejected,
            "failed" => Self::Failed,
            "deleted" => Self::Deleted,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Active => "active",
            Self::InitiatingRequest => "initiating-request",
            Self::PendingAcceptance => "pending-acceptance",
            Self::Provisioning => "provisioning",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
            Self::Deleted => "deleted",
            Self::Unknown(other) => other,
        }
    }

    /// A live connection: progressing toward, or already in, the active state.
    pub fn is_valid(&self) -> bool {
        matches!(
            self,
            Self::Active | Self::InitiatingRequest | Self::PendingAcceptance | Self::Provisioning
        )
    }

    pub fn is_pending_acceptance(&self) -> bool {
        matches!(self, Self::PendingAcceptance)
    }

    /// A terminal-negative status: no further transition is expected without
    /// creating a brand-new connection.
    pub fn is_terminal_negative(&self) -> bool {
        matches!(self, Self::Rejected | Self::Failed | Self::Deleted)
    }
}

impl fmt::Display for PeeringStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Desired state for the peering connection, from module parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DesiredState {
    /// Create the connection and activate it where possible
    #[default]
    Present,
    /// Same as `Present`
    Active,
    /// Create the connection but never force acceptance
    Pending,
    /// Tear the connection down
    Absent,
    /// Report all connections, touching nothing
    List,
}

impl DesiredState {
    pub fn from_str(s: &str) -> ModuleResult<Self> {
        match s.to_lowercase().as_str() {
            "present" => Ok(Self::Present),
            "active" => Ok(Self::Active),
            "pending" => Ok(Self::Pending),
            "absent" => Ok(Self::Absent),
            "list" => Ok(Self::List),
            _ => Err(ModuleError::InvalidParameter(format!(
                "Invalid state '{}'. Valid states: present, active, pending, absent, list",
                s
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Active => "active",
            Self::Pending => "pending",
            Self::Absent => "absent",
            Self::List => "list",
        }
    }
}

impl fmt::Display for DesiredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A VPC as resolved by the locator
#[derive(Debug, Clone, Default)]
pub struct VpcInfo {
    pub vpc_id: String,
    pub cidr_block: String,
    pub name: Option<String>,
}

/// One side of a peering connection
#[derive(Debug, Clone, Default)]
pub struct PeeringEndpoint {
    pub vpc_id: String,
    pub cidr_block: String,
    pub owner_id: String,
}

/// A VPC peering connection as reported by the API
#[derive(Debug, Clone)]
pub struct PeeringConnection {
    pub id: String,
    pub status: PeeringStatus,
    pub status_message: Option<String>,
    pub expiration: Option<String>,
    pub requester: PeeringEndpoint,
    pub accepter: PeeringEndpoint,
    pub tags: HashMap<String, String>,
}

/// Flattened connection record returned in module results
#[derive(Debug, Clone, Serialize)]
pub struct PeeringRecord {
    pub id: String,
    /// Empty string when the connection carries no expiration
    pub expiration: String,
    pub source_vpc_id: String,
    pub source_vpc_cidr: String,
    pub peer_vpc_id: String,
    pub peer_vpc_cidr: String,
    pub status: String,
    pub status_message: Option<String>,
    pub tags: HashMap<String, String>,
}

impl From<&PeeringConnection> for PeeringRecord {
    fn from(connection: &PeeringConnection) -> Self {
        Self {
            id: connection.id.clone(),
            expiration: connection.expiration.clone().unwrap_or_default(),
            source_vpc_id: connection.requester.vpc_id.clone(),
            source_vpc_cidr: connection.requester.cidr_block.clone(),
            peer_vpc_id: connection.accepter.vpc_id.clone(),
            peer_vpc_cidr: connection.accepter.cidr_block.clone(),
            status: connection.status.as_str().to_string(),
            status_message: connection.status_message.clone(),
            tags: connection.tags.clone(),
        }
    }
}

/// Server-side filter for peering connection queries
#[derive(Debug, Clone, Default)]
pub struct ConnectionFilter {
    pub source_vpc_id: String,
    pub peer_vpc_id: String,
    pub name: Option<String>,
    pub peer_owner_id: Option<String>,
}

/// The vendor control plane, as seen by the peering subsystem.
///
/// Read-path "not found" API errors surface as empty results or `None`, never
/// as `Err`. Implemented by [`AwsPeeringApi`] in production and by in-memory
/// fakes in tests.
#[async_trait]
pub trait PeeringApi: Send + Sync {
    /// Account ID of the currently authenticated caller
    async fn caller_account_id(&self) -> Result<String, PeeringError>;

    /// Available VPCs exactly matching the given VPC ID
    async fn vpcs_by_id(&self, vpc_id: &str) -> Result<Vec<VpcInfo>, PeeringError>;

    /// Available VPCs whose primary CIDR block matches
    async fn vpcs_by_cidr(&self, cidr: &str) -> Result<Vec<VpcInfo>, PeeringError>;

    /// Available VPCs whose Name tag matches
    async fn vpcs_by_name_tag(&self, name: &str) -> Result<Vec<VpcInfo>, PeeringError>;

    /// Peering connections matching the filter, in remote-defined order
    async fn peering_connections(
        &self,
        filter: &ConnectionFilter,
    ) -> Result<Vec<PeeringConnection>, PeeringError>;

    /// A single peering connection by ID, or `None` when the API reports it
    /// missing
    async fn peering_connection_by_id(
        &self,
        connection_id: &str,
    ) -> Result<Option<PeeringConnection>, PeeringError>;

    /// Every peering connection visible to the caller
    async fn all_peering_connections(&self) -> Result<Vec<PeeringConnection>, PeeringError>;

    async fn create_peering_connection(
        &self,
        source_vpc_id: &str,
        peer_vpc_id: &str,
        peer_owner_id: Option<&str>,
    ) -> Result<PeeringConnection, PeeringError>;

    async fn accept_peering_connection(&self, connection_id: &str) -> Result<(), PeeringError>;

    async fn reject_peering_connection(&self, connection_id: &str) -> Result<(), PeeringError>;

    async fn delete_peering_connection(&self, connection_id: &str) -> Result<(), PeeringError>;

    async fn tag_peering_connection(
        &self,
        connection_id: &str,
        key: &str,
        value: &str,
    ) -> Result<(), PeeringError>;
}

fn not_found_error<E, R>(err: &aws_sdk_ec2::error::SdkError<E, R>) -> bool
where
    E: ProvideErrorMetadata,
{
    err.as_service_error()
        .and_then(ProvideErrorMetadata::code)
        .is_some_and(|code| code.ends_with(".NotFound"))
}

fn remote_api_error(err: impl fmt::Display) -> PeeringError {
    PeeringError::RemoteApi(err.to_string())
}

fn vpc_info(vpc: &Vpc) -> VpcInfo {
    let name = vpc
        .tags()
        .iter()
        .find(|tag| tag.key() == Some("Name"))
        .and_then(|tag| tag.value())
        .map(str::to_string);

    VpcInfo {
        vpc_id: vpc.vpc_id().unwrap_or_default().to_string(),
        cidr_block: vpc.cidr_block().unwrap_or_default().to_string(),
        name,
    }
}

fn endpoint_info(info: Option<&VpcPeeringConnectionVpcInfo>) -> PeeringEndpoint {
    info.map(|i| PeeringEndpoint {
        vpc_id: i.vpc_id().unwrap_or_default().to_string(),
        cidr_block: i.cidr_block().unwrap_or_default().to_string(),
        owner_id: i.owner_id().unwrap_or_default().to_string(),
    })
    .unwrap_or_default()
}

fn connection_info(connection: &SdkPeeringConnection) -> PeeringConnection {
    let status = connection
        .status()
        .and_then(|s| s.code())
        .map_or_else(
            || PeeringStatus::Unknown("unreported".to_string()),
            |code| PeeringStatus::from_api_code(code.as_str()),
        );
    let status_message = connection
        .status()
        .and_then(|s| s.message())
        .map(str::to_string);

    let mut tags = HashMap::new();
    for tag in connection.tags() {
        if let (Some(key), Some(value)) = (tag.key(), tag.value()) {
            tags.insert(key.to_string(), value.to_string());
        }
    }

    PeeringConnection {
        id: connection
            .vpc_peering_connection_id()
            .unwrap_or_default()
            .to_string(),
        status,
        status_message,
        expiration: connection.expiration_time().map(|t| t.to_string()),
        requester: endpoint_info(connection.requester_vpc_info()),
        accepter: endpoint_info(connection.accepter_vpc_info()),
        tags,
    }
}

/// [`PeeringApi`] implementation backed by the AWS SDK
pub struct AwsPeeringApi {
    ec2: aws_sdk_ec2::Client,
    sts: aws_sdk_sts::Client,
    // Resolved once per invocation; never cached across invocations
    account_id: tokio::sync::OnceCell<String>,
}

impl AwsPeeringApi {
    /// Connect using the standard AWS credential chain, optionally pinning a
    /// region.
    pub async fn connect(region: Option<&str>) -> Self {
        let config = if let Some(region_str) = region {
            aws_config::defaults(BehaviorVersion::latest())
                .region(aws_sdk_ec2::config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::defaults(BehaviorVersion::latest()).load().await
        };

        Self {
            ec2: aws_sdk_ec2::Client::new(&config),
            sts: aws_sdk_sts::Client::new(&config),
            account_id: tokio::sync::OnceCell::new(),
        }
    }

    async fn describe_vpcs(&self, filters: Vec<Filter>, vpc_id: Option<&str>) -> Result<Vec<VpcInfo>, PeeringError> {
        let mut request = self.ec2.describe_vpcs();
        if let Some(id) = vpc_id {
            request = request.vpc_ids(id);
        }
        for filter in filters {
            request = request.filters(filter);
        }

        let resp = match request.send().await {
            Ok(resp) => resp,
            // A malformed or unknown VPC ID is "zero matches", not a failure
            Err(err) if not_found_error(&err) => return Ok(Vec::new()),
            Err(err) => return Err(remote_api_error(err)),
        };

        Ok(resp.vpcs().iter().map(vpc_info).collect())
    }

    fn available_filter() -> Filter {
        Filter::builder().name("state").values("available").build()
    }
}

#[async_trait]
impl PeeringApi for AwsPeeringApi {
    async fn caller_account_id(&self) -> Result<String, PeeringError> {
        let account = self
            .account_id
            .get_or_try_init(|| async {
                let identity = self
                    .sts
                    .get_caller_identity()
                    .send()
                    .await
                    .map_err(remote_api_error)?;
                identity
                    .account()
                    .map(str::to_string)
                    .ok_or_else(|| PeeringError::RemoteApi(
                        "caller identity reported no account ID".to_string(),
                    ))
            })
            .await?;
        Ok(account.clone())
    }

    async fn vpcs_by_id(&self, vpc_id: &str) -> Result<Vec<VpcInfo>, PeeringError> {
        self.describe_vpcs(vec![Self::available_filter()], Some(vpc_id))
            .await
    }

    async fn vpcs_by_cidr(&self, cidr: &str) -> Result<Vec<VpcInfo>, PeeringError> {
        let filters = vec![
            Self::available_filter(),
            Filter::builder().name("cidr").values(cidr).build(),
        ];
        self.describe_vpcs(filters, None).await
    }

    async fn vpcs_by_name_tag(&self, name: &str) -> Result<Vec<VpcInfo>, PeeringError> {
        let filters = vec![
            Self::available_filter(),
            Filter::builder().name("tag:Name").values(name).build(),
        ];
        self.describe_vpcs(filters, None).await
    }

    async fn peering_connections(
        &self,
        filter: &ConnectionFilter,
    ) -> Result<Vec<PeeringConnection>, PeeringError> {
        let mut request = self
            .ec2
            .describe_vpc_peering_connections()
            .filters(
                Filter::builder()
                    .name("requester-vpc-info.vpc-id")
                    .values(&filter.source_vpc_id)
                    .build(),
            )
            .filters(
                Filter::builder()
                    .name("accepter-vpc-info.vpc-id")
                    .values(&filter.peer_vpc_id)
                    .build(),
            );

        if let Some(owner) = &filter.peer_owner_id {
            request = request.filters(
                Filter::builder()
                    .name("accepter-vpc-info.owner-id")
                    .values(owner)
                    .build(),
            );
        }
        if let Some(name) = &filter.name {
            request = request.filters(Filter::builder().name("tag:Name").values(name).build());
        }

        let resp = request.send().await.map_err(remote_api_error)?;
        Ok(resp
            .vpc_peering_connections()
            .iter()
            .map(connection_info)
            .collect())
    }

    async fn peering_connection_by_id(
        &self,
        connection_id: &str,
    ) -> Result<Option<PeeringConnection>, PeeringError> {
        let resp = match self
            .ec2
            .describe_vpc_peering_connections()
            .vpc_peering_connection_ids(connection_id)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(err) if not_found_error(&err) => return Ok(None),
            Err(err) => return Err(remote_api_error(err)),
        };

        Ok(resp.vpc_peering_connections().first().map(connection_info))
    }

    async fn all_peering_connections(&self) -> Result<Vec<PeeringConnection>, PeeringError> {
        let resp = self
            .ec2
            .describe_vpc_peering_connections()
            .send()
            .await
            .map_err(remote_api_error)?;
        Ok(resp
            .vpc_peering_connections()
            .iter()
            .map(connection_info)
            .collect())
    }

    async fn create_peering_connection(
        &self,
        source_vpc_id: &str,
        peer_vpc_id: &str,
        peer_owner_id: Option<&str>,
    ) -> Result<PeeringConnection, PeeringError> {
        let resp = self
            .ec2
            .create_vpc_peering_connection()
            .vpc_id(source_vpc_id)
            .peer_vpc_id(peer_vpc_id)
            .set_peer_owner_id(peer_owner_id.map(str::to_string))
            .send()
            .await
            .map_err(remote_api_error)?;

        resp.vpc_peering_connection()
            .map(connection_info)
            .ok_or_else(|| {
                PeeringError::RemoteApi("create returned no peering connection".to_string())
            })
    }

    async fn accept_peering_connection(&self, connection_id: &str) -> Result<(), PeeringError> {
        self.ec2
            .accept_vpc_peering_connection()
            .vpc_peering_connection_id(connection_id)
            .send()
            .await
            .map_err(remote_api_error)?;
        Ok(())
    }

    async fn reject_peering_connection(&self, connection_id: &str) -> Result<(), PeeringError> {
        self.ec2
            .reject_vpc_peering_connection()
            .vpc_peering_connection_id(connection_id)
            .send()
            .await
            .map_err(remote_api_error)?;
        Ok(())
    }

    async fn delete_peering_connection(&self, connection_id: &str) -> Result<(), PeeringError> {
        self.ec2
            .delete_vpc_peering_connection()
            .vpc_peering_connection_id(connection_id)
            .send()
            .await
            .map_err(remote_api_error)?;
        Ok(())
    }

    async fn tag_peering_connection(
        &self,
        connection_id: &str,
        key: &str,
        value: &str,
    ) -> Result<(), PeeringError> {
        self.ec2
            .create_tags()
            .resources(connection_id)
            .tags(Tag::builder().key(key).value(value).build())
            .send()
            .await
            .map_err(remote_api_error)?;
        Ok(())
    }
}

/// Locator, query, ownership, and wait operations over a [`PeeringApi`]
pub struct VpcPeeringService<A> {
    api: A,
}

impl<A: PeeringApi> VpcPeeringService<A> {
    pub fn new(api: A) -> Self {
        Self { api }
    }

    fn single_match(
        identifier: &str,
        mut matches: Vec<VpcInfo>,
    ) -> Result<Option<VpcInfo>, PeeringError> {
        match matches.len() {
            0 => Ok(None),
            1 => Ok(Some(matches.remove(0))),
            _ => Err(PeeringError::AmbiguousResource(identifier.to_string())),
        }
    }

    /// Resolve an identifier to a single VPC.
    ///
    /// Tries the identifier as (1) a VPC ID, (2) a CIDR block when it is
    /// CIDR-shaped, (3) a Name tag. The first stage yielding exactly one
    /// match wins; a stage yielding more than one aborts with
    /// [`PeeringError::AmbiguousResource`] without trying later stages.
    pub async fn find_vpc(&self, identifier: &str) -> Result<Option<VpcInfo>, PeeringError> {
        if let Some(vpc) =
            Self::single_match(identifier, self.api.vpcs_by_id(identifier).await?)?
        {
            return Ok(Some(vpc));
        }

        if is_cidr_format(identifier) {
            if let Some(vpc) =
                Self::single_match(identifier, self.api.vpcs_by_cidr(identifier).await?)?
            {
                return Ok(Some(vpc));
            }
        }

        Self::single_match(identifier, self.api.vpcs_by_name_tag(identifier).await?)
    }

    /// Like [`find_vpc`](Self::find_vpc), but failing when nothing matches.
    pub async fn find_required_vpc(&self, identifier: &str) -> Result<VpcInfo, PeeringError> {
        self.find_vpc(identifier)
            .await?
            .ok_or_else(|| PeeringError::ResourceNotFound(identifier.to_string()))
    }

    /// Connections matching the request's source, peer, name, and peer owner.
    ///
    /// Source and peer identifiers are resolved to VPC IDs where possible;
    /// the peer is left as-is when an explicit peer owner account is given,
    /// since cross-account VPCs cannot be looked up through the caller's
    /// account.
    pub async fn find_matching_connections(
        &self,
        request: &PeeringRequest,
    ) -> Result<Vec<PeeringConnection>, PeeringError> {
        let mut source = request.source_vpc()?.to_string();
        if let Some(vpc) = self.find_vpc(&source).await? {
            source = vpc.vpc_id;
        }

        let mut peer = request.peer_vpc()?.to_string();
        if request.peer_owner_id.is_none() {
            if let Some(vpc) = self.find_vpc(&peer).await? {
                peer = vpc.vpc_id;
            }
        }

        let filter = ConnectionFilter {
            source_vpc_id: source,
            peer_vpc_id: peer,
            name: request.name.clone(),
            peer_owner_id: request.peer_owner_id.clone(),
        };
        self.api.peering_connections(&filter).await
    }

    /// Matching connections whose status is still live
    pub async fn find_valid_matching_connections(
        &self,
        request: &PeeringRequest,
    ) -> Result<Vec<PeeringConnection>, PeeringError> {
        Ok(self
            .find_matching_connections(request)
            .await?
            .into_iter()
            .filter(|connection| connection.status.is_valid())
            .collect())
    }

    pub async fn connection_by_id(
        &self,
        connection_id: &str,
    ) -> Result<Option<PeeringConnection>, PeeringError> {
        self.api.peering_connection_by_id(connection_id).await
    }

    pub async fn all_connections(&self) -> Result<Vec<PeeringConnection>, PeeringError> {
        self.api.all_peering_connections().await
    }

    /// Ownership check gating auto-accept: the accepting side's owner account
    /// must match the caller's account.
    pub async fn is_owned_by_caller(
        &self,
        connection: &PeeringConnection,
    ) -> Result<bool, PeeringError> {
        Ok(connection.accepter.owner_id == self.api.caller_account_id().await?)
    }

    pub async fn create_connection(
        &self,
        source_vpc_id: &str,
        peer_vpc_id: &str,
        peer_owner_id: Option<&str>,
    ) -> Result<PeeringConnection, PeeringError> {
        let connection = self
            .api
            .create_peering_connection(source_vpc_id, peer_vpc_id, peer_owner_id)
            .await?;
        tracing::info!(
            connection_id = %connection.id,
            source = source_vpc_id,
            peer = peer_vpc_id,
            "created VPC peering connection"
        );
        Ok(connection)
    }

    pub async fn accept_connection(&self, connection_id: &str) -> Result<(), PeeringError> {
        self.api.accept_peering_connection(connection_id).await?;
        tracing::info!(connection_id, "accepted VPC peering connection");
        Ok(())
    }

    pub async fn reject_connection(&self, connection_id: &str) -> Result<(), PeeringError> {
        self.api.reject_peering_connection(connection_id).await?;
        tracing::info!(connection_id, "rejected VPC peering connection");
        Ok(())
    }

    pub async fn delete_connection(&self, connection_id: &str) -> Result<(), PeeringError> {
        self.api.delete_peering_connection(connection_id).await?;
        tracing::info!(connection_id, "deleted VPC peering connection");
        Ok(())
    }

    pub async fn tag_connection(
        &self,
        connection_id: &str,
        key: &str,
        value: &str,
    ) -> Result<(), PeeringError> {
        self.api
            .tag_peering_connection(connection_id, key, value)
            .await
    }

    /// Poll a connection until its status is one of `acceptable`, checking
    /// once per [`POLL_INTERVAL`], bounded by `timeout` of wall-clock time.
    ///
    /// The status is checked before the first sleep, so an already-satisfied
    /// wait returns without delay. Returns the freshly fetched connection
    /// record.
    pub async fn wait_for_connection_state(
        &self,
        connection_id: &str,
        acceptable: &[PeeringStatus],
        timeout: Duration,
    ) -> Result<PeeringConnection, PeeringError> {
        let start = Instant::now();
        tracing::debug!(connection_id, ?timeout, "waiting for peering connection state");

        loop {
            if let Some(connection) = self.connection_by_id(connection_id).await? {
                if acceptable.contains(&connection.status) {
                    return Ok(connection);
                }
            }

            if start.elapsed() >= timeout {
                return Err(PeeringError::WaitTimeout {
                    connection_id: connection_id.to_string(),
                    timeout_secs: timeout.as_secs(),
                });
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// Immutable request configuration parsed once from module parameters
#[derive(Debug, Clone)]
pub struct PeeringRequest {
    pub name: Option<String>,
    pub source_vpc: Option<String>,
    pub peer_vpc: Option<String>,
    pub peer_owner_id: Option<String>,
    pub state: DesiredState,
    pub force_accept: bool,
    pub ignore_rejection: bool,
    pub always_delete: bool,
    pub wait_timeout: u64,
    pub region: Option<String>,
}

impl PeeringRequest {
    pub fn from_params(params: &ModuleParams) -> ModuleResult<Self> {
        let state = if let Some(s) = params.get_string("state")? {
            DesiredState::from_str(&s)?
        } else {
            DesiredState::default()
        };

        let request = Self {
            name: params.get_string("name")?,
            source_vpc: params.get_string("source_vpc")?,
            // dest_vpc is accepted as a legacy alias for peer_vpc
            peer_vpc: match params.get_string("peer_vpc")? {
                Some(peer) => Some(peer),
                None => params.get_string("dest_vpc")?,
            },
            peer_owner_id: params.get_string("peer_owner_id")?,
            state,
            force_accept: params.get_bool("force_accept")?.unwrap_or(false),
            ignore_rejection: params.get_bool("ignore_rejection")?.unwrap_or(false),
            always_delete: params.get_bool("always_delete")?.unwrap_or(false),
            wait_timeout: u64::try_from(params.get_i64("wait_timeout")?.unwrap_or(300))
                .map_err(|_| {
                    ModuleError::InvalidParameter(
                        "wait_timeout must be a non-negative integer".to_string(),
                    )
                })?,
            region: params.get_string("region")?,
        };

        request.validate()?;
        Ok(request)
    }

    /// Eager validation, before any remote call is made
    fn validate(&self) -> ModuleResult<()> {
        if self.state != DesiredState::List
            && (self.source_vpc.is_none() || self.peer_vpc.is_none())
        {
            return Err(ModuleError::MissingParameter(
                "source_vpc and peer_vpc are required unless state is \"list\"".to_string(),
            ));
        }
        Ok(())
    }

    fn source_vpc(&self) -> Result<&str, PeeringError> {
        self.source_vpc.as_deref().ok_or_else(|| {
            PeeringError::Validation("source_vpc is required for this state".to_string())
        })
    }

    fn peer_vpc(&self) -> Result<&str, PeeringError> {
        self.peer_vpc.as_deref().ok_or_else(|| {
            PeeringError::Validation("peer_vpc is required for this state".to_string())
        })
    }
}

/// The reconciliation state machine: drives existing peering connections
/// toward the requested desired state with the minimal set of mutating calls.
///
/// All state lives on the remote side; every invocation re-queries from
/// scratch. No client-side locking is performed, and the peering API offers
/// no conditional create, so two concurrent invocations targeting the same
/// endpoint pair can race: callers must serialize invocations per
/// (source, peer) pair.
pub struct PeeringReconciler<A> {
    request: PeeringRequest,
    service: VpcPeeringService<A>,
    check_mode: bool,
}

impl<A: PeeringApi> PeeringReconciler<A> {
    pub fn new(request: PeeringRequest, api: A) -> Self {
        Self {
            request,
            service: VpcPeeringService::new(api),
            check_mode: false,
        }
    }

    #[must_use]
    pub fn with_check_mode(mut self, check_mode: bool) -> Self {
        self.check_mode = check_mode;
        self
    }

    /// Run the reconciliation for the request's desired state.
    ///
    /// Returns `(changed, connections)`: `changed` is true iff any mutating
    /// API call was issued (or would have been, in check mode).
    pub async fn run(&self) -> Result<(bool, Vec<PeeringConnection>), PeeringError> {
        match self.request.state {
            DesiredState::List => self.list_all().await,
            DesiredState::Present | DesiredState::Active => self.ensure_present(true).await,
            DesiredState::Pending => self.ensure_present(false).await,
            DesiredState::Absent => self.ensure_absent().await,
        }
    }

    /// Report every peering connection, touching nothing.
    async fn list_all(&self) -> Result<(bool, Vec<PeeringConnection>), PeeringError> {
        Ok((false, self.service.all_connections().await?))
    }

    /// Ensure a live peering connection exists for the requested pair,
    /// creating one if needed. With `want_active`, additionally accept
    /// connections pending acceptance where ownership (or `force_accept`)
    /// allows.
    async fn ensure_present(
        &self,
        want_active: bool,
    ) -> Result<(bool, Vec<PeeringConnection>), PeeringError> {
        if self.check_mode {
            return self.check_present(want_active).await;
        }

        let mut changed = false;
        let connections = self.service.find_matching_connections(&self.request).await?;

        if connections.is_empty() {
            self.create().await?;
            changed = true;
        }

        let mut valid = self
            .service
            .find_valid_matching_connections(&self.request)
            .await?;

        if valid.is_empty() {
            // Everything previously seen is rejected, failed, or deleted. A
            // history consisting solely of rejections is not resurrected
            // unless the caller ignores the rejection signal.
            if self.should_recreate(&connections) {
                self.create().await?;
                changed = true;
                valid = self
                    .service
                    .find_valid_matching_connections(&self.request)
                    .await?;
            }
        }

        if !want_active {
            return Ok((changed, valid));
        }

        for connection in valid.iter().filter(|c| c.status.is_pending_acceptance()) {
            if self.attempt_auto_accept(connection).await? {
                changed = true;
            }
        }

        let results = self
            .service
            .find_valid_matching_connections(&self.request)
            .await?;
        Ok((changed, results))
    }

    /// Check-mode counterpart of [`ensure_present`](Self::ensure_present):
    /// one read-only query pass, reporting what would change.
    async fn check_present(
        &self,
        want_active: bool,
    ) -> Result<(bool, Vec<PeeringConnection>), PeeringError> {
        let connections = self.service.find_matching_connections(&self.request).await?;
        let valid: Vec<PeeringConnection> = connections
            .iter()
            .filter(|c| c.status.is_valid())
            .cloned()
            .collect();

        let mut changed = if connections.is_empty() {
            true
        } else {
            valid.is_empty() && self.should_recreate(&connections)
        };

        if want_active {
            for connection in valid.iter().filter(|c| c.status.is_pending_acceptance()) {
                if self.request.force_accept
                    || self.service.is_owned_by_caller(connection).await?
                {
                    changed = true;
                }
            }
        }

        Ok((changed, valid))
    }

    /// Ensure no live peering connection remains for the requested pair.
    /// Connections pending acceptance are rejected rather than deleted,
    /// unless `always_delete` is set.
    async fn ensure_absent(&self) -> Result<(bool, Vec<PeeringConnection>), PeeringError> {
        let valid = self
            .service
            .find_valid_matching_connections(&self.request)
            .await?;

        if valid.is_empty() {
            return Ok((false, Vec::new()));
        }

        if self.check_mode {
            let results = self.service.find_matching_connections(&self.request).await?;
            return Ok((true, results));
        }

        for connection in &valid {
            if self.request.always_delete || !connection.status.is_pending_acceptance() {
                self.service.delete_connection(&connection.id).await?;
            } else {
                self.service.reject_connection(&connection.id).await?;
            }
        }

        // The re-queried set includes the newly rejected/deleted entries,
        // subject to the remote API's read-after-write consistency.
        let results = self.service.find_matching_connections(&self.request).await?;
        Ok((true, results))
    }

    /// Re-creation policy when every match is terminal: suppressed only when
    /// the matches are purely rejections and `ignore_rejection` is unset. A
    /// mix of rejected and other terminal statuses stays eligible.
    fn should_recreate(&self, connections: &[PeeringConnection]) -> bool {
        if self.request.ignore_rejection {
            return true;
        }
        !connections
            .iter()
            .all(|c| c.status == PeeringStatus::Rejected)
    }

    /// Accept a pending connection when `force_accept` is set or the caller
    /// owns the accepting side. Leaving a non-eligible connection pending is
    /// not an error.
    async fn attempt_auto_accept(
        &self,
        connection: &PeeringConnection,
    ) -> Result<bool, PeeringError> {
        if !connection.status.is_pending_acceptance() {
            return Ok(false);
        }
        if self.request.force_accept || self.service.is_owned_by_caller(connection).await? {
            self.service.accept_connection(&connection.id).await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Create a peering connection per the request.
    ///
    /// Both endpoints are resolved before anything is mutated, so ambiguous
    /// or missing identifiers abort with no side effects. The peer identifier
    /// is passed through unresolved when an explicit peer owner account is
    /// given. The created connection is tagged and then polled until it
    /// settles into `pending-acceptance` or `active`.
    async fn create(&self) -> Result<PeeringConnection, PeeringError> {
        let source = self
            .service
            .find_required_vpc(self.request.source_vpc()?)
            .await?;

        let peer_id = match &self.request.peer_owner_id {
            Some(_) => self.request.peer_vpc()?.to_string(),
            None => {
                self.service
                    .find_required_vpc(self.request.peer_vpc()?)
                    .await?
                    .vpc_id
            }
        };

        let connection = self
            .service
            .create_connection(
                &source.vpc_id,
                &peer_id,
                self.request.peer_owner_id.as_deref(),
            )
            .await?;

        if let Some(name) = &self.request.name {
            self.service
                .tag_connection(&connection.id, "Name", name)
                .await?;
        }

        self.service
            .wait_for_connection_state(
                &connection.id,
                CREATE_WAIT_STATES,
                Duration::from_secs(self.request.wait_timeout),
            )
            .await
    }
}

/// AWS VPC peering connection module
pub struct VpcPeeringModule;

impl VpcPeeringModule {
    async fn execute_async(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let request = PeeringRequest::from_params(params)?;
        let state = request.state;

        let api = AwsPeeringApi::connect(request.region.as_deref()).await;
        let reconciler = PeeringReconciler::new(request, api).with_check_mode(context.check_mode);

        let (changed, connections) = reconciler.run().await.map_err(ModuleError::from)?;
        let records: Vec<PeeringRecord> = connections.iter().map(PeeringRecord::from).collect();

        let msg = if changed {
            format!(
                "Reconciled peering state '{}'; {} matching connection(s)",
                state,
                records.len()
            )
        } else {
            format!(
                "Peering state '{}' already satisfied; {} matching connection(s)",
                state,
                records.len()
            )
        };

        let mut output = if changed {
            ModuleOutput::changed(msg)
        } else {
            ModuleOutput::ok(msg)
        };
        output = output.with_data(
            "results",
            serde_json::to_value(&records)
                .map_err(|e| ModuleError::ExecutionFailed(e.to_string()))?,
        );
        Ok(output)
    }
}

impl Module for VpcPeeringModule {
    fn name(&self) -> &'static str {
        "aws_vpc_peering"
    }

    fn description(&self) -> &'static str {
        "Create, accept, reject, delete, and list AWS VPC peering connections"
    }

    fn parallelization_hint(&self) -> ParallelizationHint {
        // Read-then-act against an API with no conditional create: concurrent
        // invocations on the same endpoint pair race.
        ParallelizationHint::GlobalExclusive
    }

    fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| ModuleError::ExecutionFailed("No tokio runtime available".to_string()))?;

        let params = params.clone();
        let context = context.clone();
        let module = self;

        std::thread::scope(|s| {
            s.spawn(|| handle.block_on(module.execute_async(&params, &context)))
                .join()
                .unwrap()
        })
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        PeeringRequest::from_params(params).map(|_| ())
    }
}
