//! Tests for the VPC peering reconciliation core.
//!
//! These tests drive `PeeringReconciler` and `VpcPeeringService` through an
//! in-memory fake of the remote control plane, verifying:
//! - idempotence of repeated reconciliations
//! - locator resolution order (ID, then CIDR, then Name tag) and ambiguity
//! - desired-state handler behavior for every state
//! - the rejected-connection resurrection policy
//! - ownership-gated auto-accept and the force_accept override
//! - the bounded wait loop

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use awsible::modules::cloud::aws::peering::{
    ConnectionFilter, DesiredState, PeeringApi, PeeringConnection, PeeringEndpoint,
    PeeringError, PeeringReconciler, PeeringRequest, PeeringStatus, VpcInfo, VpcPeeringService,
};
use pretty_assertions::assert_eq;

const ACCOUNT: &str = "111111111111";
const OTHER_ACCOUNT: &str = "222222222222";

#[derive(Default)]
struct FakeState {
    vpcs: Vec<VpcInfo>,
    connections: Vec<PeeringConnection>,
    account_id: String,
    create_status: Option<PeeringStatus>,
    next_id: u32,
    creates: u32,
    accepts: u32,
    rejects: u32,
    deletes: u32,
    id_queries: u32,
    cidr_queries: u32,
    name_queries: u32,
}

/// In-memory stand-in for the AWS control plane. Cloning shares state, so a
/// test can hand a clone to the reconciler and keep one for inspection.
#[derive(Clone)]
struct FakeApi {
    state: Arc<Mutex<FakeState>>,
}

impl FakeApi {
    fn new() -> Self {
        let api = Self {
            state: Arc::new(Mutex::new(FakeState {
                account_id: ACCOUNT.to_string(),
                ..FakeState::default()
            })),
        };
        api.add_vpc("vpc-aaa", "10.0.0.0/16", Some("alpha"));
        api.add_vpc("vpc-bbb", "10.1.0.0/16", Some("beta"));
        api
    }

    fn add_vpc(&self, vpc_id: &str, cidr: &str, name: Option<&str>) {
        self.state.lock().unwrap().vpcs.push(VpcInfo {
            vpc_id: vpc_id.to_string(),
            cidr_block: cidr.to_string(),
            name: name.map(str::to_string),
        });
    }

    fn add_connection(&self, id: &str, accepter_owner: &str, status: PeeringStatus) {
        self.state.lock().unwrap().connections.push(PeeringConnection {
            id: id.to_string(),
            status,
            status_message: None,
            expiration: None,
            requester: PeeringEndpoint {
                vpc_id: "vpc-aaa".to_string(),
                cidr_block: "10.0.0.0/16".to_string(),
                owner_id: ACCOUNT.to_string(),
            },
            accepter: PeeringEndpoint {
                vpc_id: "vpc-bbb".to_string(),
                cidr_block: "10.1.0.0/16".to_string(),
                owner_id: accepter_owner.to_string(),
            },
            tags: HashMap::new(),
        });
    }

    /// Status newly created connections report (default: pending-acceptance)
    fn set_create_status(&self, status: PeeringStatus) {
        self.state.lock().unwrap().create_status = Some(status);
    }

    fn creates(&self) -> u32 {
        self.state.lock().unwrap().creates
    }

    fn accepts(&self) -> u32 {
        self.state.lock().unwrap().accepts
    }

    fn rejects(&self) -> u32 {
        self.state.lock().unwrap().rejects
    }

    fn deletes(&self) -> u32 {
        self.state.lock().unwrap().deletes
    }

    fn mutation_count(&self) -> u32 {
        let state = self.state.lock().unwrap();
        state.creates + state.accepts + state.rejects + state.deletes
    }

    fn cidr_queries(&self) -> u32 {
        self.state.lock().unwrap().cidr_queries
    }

    fn name_queries(&self) -> u32 {
        self.state.lock().unwrap().name_queries
    }
}

#[async_trait]
impl PeeringApi for FakeApi {
    async fn caller_account_id(&self) -> Result<String, PeeringError> {
        Ok(self.state.lock().unwrap().account_id.clone())
    }

    async fn vpcs_by_id(&self, vpc_id: &str) -> Result<Vec<VpcInfo>, PeeringError> {
        let mut state = self.state.lock().unwrap();
        state.id_queries += 1;
        Ok(state
            .vpcs
            .iter()
            .filter(|vpc| vpc.vpc_id == vpc_id)
            .cloned()
            .collect())
    }

    async fn vpcs_by_cidr(&self, cidr: &str) -> Result<Vec<VpcInfo>, PeeringError> {
        let mut state = self.state.lock().unwrap();
        state.cidr_queries += 1;
        Ok(state
            .vpcs
            .iter()
            .filter(|vpc| vpc.cidr_block == cidr)
            .cloned()
            .collect())
    }

    async fn vpcs_by_name_tag(&self, name: &str) -> Result<Vec<VpcInfo>, PeeringError> {
        let mut state = self.state.lock().unwrap();
        state.name_queries += 1;
        Ok(state
            .vpcs
            .iter()
            .filter(|vpc| vpc.name.as_deref() == Some(name))
            .cloned()
            .collect())
    }

    async fn peering_connections(
        &self,
        filter: &ConnectionFilter,
    ) -> Result<Vec<PeeringConnection>, PeeringError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .connections
            .iter()
            .filter(|c| {
                c.requester.vpc_id == filter.source_vpc_id
                    && c.accepter.vpc_id == filter.peer_vpc_id
                    && filter
                        .peer_owner_id
                        .as_ref()
                        .map_or(true, |owner| c.accepter.owner_id == *owner)
                    && filter
                        .name
                        .as_ref()
                        .map_or(true, |name| c.tags.get("Name") == Some(name))
            })
            .cloned()
            .collect())
    }

    async fn peering_connection_by_id(
        &self,
        connection_id: &str,
    ) -> Result<Option<PeeringConnection>, PeeringError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .connections
            .iter()
            .find(|c| c.id == connection_id)
            .cloned())
    }

    async fn all_peering_connections(&self) -> Result<Vec<PeeringConnection>, PeeringError> {
        Ok(self.state.lock().unwrap().connections.clone())
    }

    async fn create_peering_connection(
        &self,
        source_vpc_id: &str,
        peer_vpc_id: &str,
        peer_owner_id: Option<&str>,
    ) -> Result<PeeringConnection, PeeringError> {
        let mut state = self.state.lock().unwrap();
        state.creates += 1;
        state.next_id += 1;

        let cidr_of = |vpc_id: &str, state: &FakeState| {
            state
                .vpcs
                .iter()
                .find(|v| v.vpc_id == vpc_id)
                .map(|v| v.cidr_block.clone())
                .unwrap_or_default()
        };

        let connection = PeeringConnection {
            id: format!("pcx-fake{:03}", state.next_id),
            status: state
                .create_status
                .clone()
                .unwrap_or(PeeringStatus::PendingAcceptance),
            status_message: None,
            expiration: None,
            requester: PeeringEndpoint {
                vpc_id: source_vpc_id.to_string(),
                cidr_block: cidr_of(source_vpc_id, &state),
                owner_id: state.account_id.clone(),
            },
            accepter: PeeringEndpoint {
                vpc_id: peer_vpc_id.to_string(),
                cidr_block: cidr_of(peer_vpc_id, &state),
                owner_id: peer_owner_id
                    .map(str::to_string)
                    .unwrap_or_else(|| state.account_id.clone()),
            },
            tags: HashMap::new(),
        };
        state.connections.push(connection.clone());
        Ok(connection)
    }

    async fn accept_peering_connection(&self, connection_id: &str) -> Result<(), PeeringError> {
        let mut state = self.state.lock().unwrap();
        state.accepts += 1;
        if let Some(connection) = state.connections.iter_mut().find(|c| c.id == connection_id) {
            connection.status = PeeringStatus::Active;
        }
        Ok(())
    }

    async fn reject_peering_connection(&self, connection_id: &str) -> Result<(), PeeringError> {
        let mut state = self.state.lock().unwrap();
        state.rejects += 1;
        if let Some(connection) = state.connections.iter_mut().find(|c| c.id == connection_id) {
            connection.status = PeeringStatus::Rejected;
        }
        Ok(())
    }

    async fn delete_peering_connection(&self, connection_id: &str) -> Result<(), PeeringError> {
        let mut state = self.state.lock().unwrap();
        state.deletes += 1;
        if let Some(connection) = state.connections.iter_mut().find(|c| c.id == connection_id) {
            connection.status = PeeringStatus::Deleted;
        }
        Ok(())
    }

    async fn tag_peering_connection(
        &self,
        connection_id: &str,
        key: &str,
        value: &str,
    ) -> Result<(), PeeringError> {
        let mut state = self.state.lock().unwrap();
        if let Some(connection) = state.connections.iter_mut().find(|c| c.id == connection_id) {
            connection
                .tags
                .insert(key.to_string(), value.to_string());
        }
        Ok(())
    }
}

fn request(state: DesiredState) -> PeeringRequest {
    PeeringRequest {
        name: None,
        source_vpc: Some("vpc-aaa".to_string()),
        peer_vpc: Some("vpc-bbb".to_string()),
        peer_owner_id: None,
        state,
        force_accept: false,
        ignore_rejection: false,
        always_delete: false,
        wait_timeout: 30,
        region: None,
    }
}

async fn run(
    api: &FakeApi,
    request: PeeringRequest,
) -> Result<(bool, Vec<PeeringConnection>), PeeringError> {
    PeeringReconciler::new(request, api.clone()).run().await
}

// ============================================================================
// Desired-state scenarios
// ============================================================================

#[tokio::test]
async fn pending_from_empty_creates_once() {
    let api = FakeApi::new();

    let (changed, results) = run(&api, request(DesiredState::Pending)).await.unwrap();

    assert!(changed);
    assert_eq!(api.creates(), 1);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, PeeringStatus::PendingAcceptance);
}

#[tokio::test]
async fn pending_never_accepts() {
    let api = FakeApi::new();
    api.add_connection("pcx-1", ACCOUNT, PeeringStatus::PendingAcceptance);

    let (changed, results) = run(&api, request(DesiredState::Pending)).await.unwrap();

    assert!(!changed);
    assert_eq!(api.accepts(), 0);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, PeeringStatus::PendingAcceptance);
}

#[tokio::test]
async fn present_creates_and_activates() {
    let api = FakeApi::new();

    let (changed, results) = run(&api, request(DesiredState::Present)).await.unwrap();

    assert!(changed);
    assert_eq!(api.creates(), 1);
    assert_eq!(api.accepts(), 1);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, PeeringStatus::Active);
}

#[tokio::test]
async fn present_twice_is_idempotent() {
    let api = FakeApi::new();

    let (first, _) = run(&api, request(DesiredState::Present)).await.unwrap();
    let (second, results) = run(&api, request(DesiredState::Present)).await.unwrap();

    assert!(first);
    assert!(!second);
    assert_eq!(api.creates(), 1);
    assert_eq!(api.accepts(), 1);
    assert_eq!(results[0].status, PeeringStatus::Active);
}

#[tokio::test]
async fn active_accepts_owned_pending_connection() {
    let api = FakeApi::new();
    api.add_connection("pcx-1", ACCOUNT, PeeringStatus::PendingAcceptance);

    let (changed, results) = run(&api, request(DesiredState::Active)).await.unwrap();

    assert!(changed);
    assert_eq!(api.creates(), 0);
    assert_eq!(api.accepts(), 1);
    assert_eq!(results[0].status, PeeringStatus::Active);
}

#[tokio::test]
async fn active_leaves_unowned_pending_connection() {
    let api = FakeApi::new();
    api.add_connection("pcx-1", OTHER_ACCOUNT, PeeringStatus::PendingAcceptance);

    let (changed, results) = run(&api, request(DesiredState::Active)).await.unwrap();

    // Not accepting a connection we don't own is not an error
    assert!(!changed);
    assert_eq!(api.accepts(), 0);
    assert_eq!(results[0].status, PeeringStatus::PendingAcceptance);
}

#[tokio::test]
async fn force_accept_overrides_ownership_check() {
    let api = FakeApi::new();
    api.add_connection("pcx-1", OTHER_ACCOUNT, PeeringStatus::PendingAcceptance);

    let mut req = request(DesiredState::Active);
    req.force_accept = true;
    let (changed, results) = run(&api, req).await.unwrap();

    assert!(changed);
    assert_eq!(api.accepts(), 1);
    assert_eq!(results[0].status, PeeringStatus::Active);
}

#[tokio::test]
async fn present_does_not_resurrect_purely_rejected_history() {
    let api = FakeApi::new();
    api.add_connection("pcx-1", ACCOUNT, PeeringStatus::Rejected);
    api.add_connection("pcx-2", ACCOUNT, PeeringStatus::Rejected);

    let (changed, results) = run(&api, request(DesiredState::Present)).await.unwrap();

    assert!(!changed);
    assert_eq!(api.creates(), 0);
    assert!(results.is_empty());
}

#[tokio::test]
async fn present_recreates_when_history_mixes_rejected_and_failed() {
    let api = FakeApi::new();
    api.add_connection("pcx-1", ACCOUNT, PeeringStatus::Rejected);
    api.add_connection("pcx-2", ACCOUNT, PeeringStatus::Failed);

    let (changed, results) = run(&api, request(DesiredState::Present)).await.unwrap();

    assert!(changed);
    assert_eq!(api.creates(), 1);
    assert_eq!(results.len(), 1);
}

#[tokio::test]
async fn ignore_rejection_recreates_rejected_history() {
    let api = FakeApi::new();
    api.add_connection("pcx-1", ACCOUNT, PeeringStatus::Rejected);

    let mut req = request(DesiredState::Pending);
    req.ignore_rejection = true;
    let (changed, results) = run(&api, req).await.unwrap();

    assert!(changed);
    assert_eq!(api.creates(), 1);
    assert_eq!(results.len(), 1);
}

#[tokio::test]
async fn absent_rejects_pending_connection() {
    let api = FakeApi::new();
    api.add_connection("pcx-1", ACCOUNT, PeeringStatus::PendingAcceptance);

    let (changed, results) = run(&api, request(DesiredState::Absent)).await.unwrap();

    assert!(changed);
    assert_eq!(api.rejects(), 1);
    assert_eq!(api.deletes(), 0);
    // The re-queried set reflects the rejection
    assert_eq!(results[0].status, PeeringStatus::Rejected);
}

#[tokio::test]
async fn absent_deletes_active_connection() {
    let api = FakeApi::new();
    api.add_connection("pcx-1", ACCOUNT, PeeringStatus::Active);

    let (changed, results) = run(&api, request(DesiredState::Absent)).await.unwrap();

    assert!(changed);
    assert_eq!(api.deletes(), 1);
    assert_eq!(api.rejects(), 0);
    assert_eq!(results[0].status, PeeringStatus::Deleted);
}

#[tokio::test]
async fn absent_always_delete_deletes_pending_connection() {
    let api = FakeApi::new();
    api.add_connection("pcx-1", ACCOUNT, PeeringStatus::PendingAcceptance);

    let mut req = request(DesiredState::Absent);
    req.always_delete = true;
    let (changed, _) = run(&api, req).await.unwrap();

    assert!(changed);
    assert_eq!(api.deletes(), 1);
    assert_eq!(api.rejects(), 0);
}

#[tokio::test]
async fn absent_twice_is_idempotent() {
    let api = FakeApi::new();
    api.add_connection("pcx-1", ACCOUNT, PeeringStatus::Active);

    let (first, _) = run(&api, request(DesiredState::Absent)).await.unwrap();
    let (second, results) = run(&api, request(DesiredState::Absent)).await.unwrap();

    assert!(first);
    assert!(!second);
    assert_eq!(api.deletes(), 1);
    assert!(results.is_empty());
}

#[tokio::test]
async fn list_issues_no_mutating_calls() {
    let api = FakeApi::new();
    api.add_connection("pcx-1", ACCOUNT, PeeringStatus::Active);
    api.add_connection("pcx-2", ACCOUNT, PeeringStatus::Rejected);

    let mut req = request(DesiredState::List);
    // list touches nothing no matter what else is set
    req.force_accept = true;
    req.always_delete = true;
    req.source_vpc = None;
    req.peer_vpc = None;
    let (changed, results) = run(&api, req).await.unwrap();

    assert!(!changed);
    assert_eq!(api.mutation_count(), 0);
    // Unfiltered: invalid connections are listed too
    assert_eq!(results.len(), 2);
}

// ============================================================================
// Resource locator
// ============================================================================

#[tokio::test]
async fn locator_resolves_by_id_cidr_and_name() {
    let api = FakeApi::new();
    let service = VpcPeeringService::new(api.clone());

    let by_id = service.find_vpc("vpc-aaa").await.unwrap().unwrap();
    assert_eq!(by_id.vpc_id, "vpc-aaa");

    let by_cidr = service.find_vpc("10.1.0.0/16").await.unwrap().unwrap();
    assert_eq!(by_cidr.vpc_id, "vpc-bbb");

    let by_name = service.find_vpc("alpha").await.unwrap().unwrap();
    assert_eq!(by_name.vpc_id, "vpc-aaa");
}

#[tokio::test]
async fn locator_id_match_wins_over_name_match() {
    let api = FakeApi::new();
    // One VPC is named after another VPC's ID
    api.add_vpc("shared", "10.2.0.0/16", None);
    api.add_vpc("vpc-ccc", "10.3.0.0/16", Some("shared"));
    let service = VpcPeeringService::new(api.clone());

    let vpc = service.find_vpc("shared").await.unwrap().unwrap();

    assert_eq!(vpc.vpc_id, "shared");
    // The name-tag stage was never attempted
    assert_eq!(api.name_queries(), 0);
}

#[tokio::test]
async fn locator_skips_cidr_stage_for_non_cidr_identifiers() {
    let api = FakeApi::new();
    let service = VpcPeeringService::new(api.clone());

    service.find_vpc("alpha").await.unwrap();
    assert_eq!(api.cidr_queries(), 0);

    service.find_vpc("10.0.0.0/16").await.unwrap();
    assert_eq!(api.cidr_queries(), 1);
}

#[tokio::test]
async fn locator_ambiguity_aborts_without_further_stages() {
    let api = FakeApi::new();
    api.add_vpc("vpc-dup1", "10.9.0.0/16", Some("dup"));
    api.add_vpc("vpc-dup2", "10.9.0.0/16", Some("dup"));
    let service = VpcPeeringService::new(api.clone());

    let err = service.find_vpc("10.9.0.0/16").await.unwrap_err();

    assert!(matches!(err, PeeringError::AmbiguousResource(_)));
    // Ambiguity at the CIDR stage never falls through to the name stage
    assert_eq!(api.name_queries(), 0);
}

#[tokio::test]
async fn locator_returns_none_when_nothing_matches() {
    let api = FakeApi::new();
    let service = VpcPeeringService::new(api.clone());

    assert!(service.find_vpc("vpc-nope").await.unwrap().is_none());

    let err = service.find_required_vpc("vpc-nope").await.unwrap_err();
    assert!(matches!(err, PeeringError::ResourceNotFound(_)));
}

#[tokio::test]
async fn ambiguous_source_aborts_before_any_mutation() {
    let api = FakeApi::new();
    api.add_vpc("vpc-dup1", "10.9.0.0/16", Some("dup"));
    api.add_vpc("vpc-dup2", "10.9.0.0/16", Some("dup"));

    let mut req = request(DesiredState::Present);
    req.source_vpc = Some("dup".to_string());
    let err = run(&api, req).await.unwrap_err();

    assert!(matches!(err, PeeringError::AmbiguousResource(_)));
    assert_eq!(api.mutation_count(), 0);
}

// ============================================================================
// Creation protocol
// ============================================================================

#[tokio::test]
async fn create_resolves_endpoints_by_cidr_and_name() {
    let api = FakeApi::new();

    let mut req = request(DesiredState::Pending);
    req.source_vpc = Some("10.0.0.0/16".to_string());
    req.peer_vpc = Some("beta".to_string());
    let (changed, results) = run(&api, req).await.unwrap();

    assert!(changed);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].requester.vpc_id, "vpc-aaa");
    assert_eq!(results[0].accepter.vpc_id, "vpc-bbb");
}

#[tokio::test]
async fn create_with_peer_owner_skips_peer_resolution() {
    let api = FakeApi::new();

    let mut req = request(DesiredState::Pending);
    // A cross-account VPC the caller's account cannot describe
    req.peer_vpc = Some("vpc-remote".to_string());
    req.peer_owner_id = Some(OTHER_ACCOUNT.to_string());
    let (changed, results) = run(&api, req).await.unwrap();

    assert!(changed);
    assert_eq!(api.creates(), 1);
    assert_eq!(results[0].accepter.vpc_id, "vpc-remote");
    assert_eq!(results[0].accepter.owner_id, OTHER_ACCOUNT);
    assert_eq!(results[0].status, PeeringStatus::PendingAcceptance);
}

#[tokio::test]
async fn create_tags_connection_with_name() {
    let api = FakeApi::new();

    let mut req = request(DesiredState::Pending);
    req.name = Some("alpha-to-beta".to_string());
    let (_, results) = run(&api, req).await.unwrap();

    assert_eq!(
        results[0].tags.get("Name"),
        Some(&"alpha-to-beta".to_string())
    );
}

#[tokio::test]
async fn create_times_out_when_connection_never_settles() {
    let api = FakeApi::new();
    api.set_create_status(PeeringStatus::InitiatingRequest);

    let mut req = request(DesiredState::Pending);
    req.wait_timeout = 0;
    let err = run(&api, req).await.unwrap_err();

    assert!(matches!(err, PeeringError::WaitTimeout { .. }));
}

// ============================================================================
// Check mode
// ============================================================================

#[tokio::test]
async fn check_mode_present_reports_create_without_mutating() {
    let api = FakeApi::new();

    let (changed, results) = PeeringReconciler::new(request(DesiredState::Present), api.clone())
        .with_check_mode(true)
        .run()
        .await
        .unwrap();

    assert!(changed);
    assert_eq!(api.mutation_count(), 0);
    assert!(results.is_empty());
}

#[tokio::test]
async fn check_mode_absent_reports_removal_without_mutating() {
    let api = FakeApi::new();
    api.add_connection("pcx-1", ACCOUNT, PeeringStatus::Active);

    let (changed, results) = PeeringReconciler::new(request(DesiredState::Absent), api.clone())
        .with_check_mode(true)
        .run()
        .await
        .unwrap();

    assert!(changed);
    assert_eq!(api.mutation_count(), 0);
    assert_eq!(results[0].status, PeeringStatus::Active);
}

#[tokio::test]
async fn check_mode_is_satisfied_when_state_already_converged() {
    let api = FakeApi::new();
    api.add_connection("pcx-1", ACCOUNT, PeeringStatus::Active);

    let (changed, _) = PeeringReconciler::new(request(DesiredState::Present), api.clone())
        .with_check_mode(true)
        .run()
        .await
        .unwrap();

    assert!(!changed);
    assert_eq!(api.mutation_count(), 0);
}
