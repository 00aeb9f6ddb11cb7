//! BDD scenarios for the provisioning workflow.

use rstest_bdd_macros::scenario;

use super::test_helpers::{ProvisionContextResult, provision_context_result};

#[scenario(
    path = "tests/features/provision.feature",
    name = "Serve a notebook and clean up after Ctrl-C"
)]
fn scenario_serve_notebook(provision_context_result: ProvisionContextResult) {
    drop(provision_context_result);
}

#[scenario(
    path = "tests/features/provision.feature",
    name = "Refuse a changed host key for the local tunnel"
)]
fn scenario_changed_host_key(provision_context_result: ProvisionContextResult) {
    drop(provision_context_result);
}
