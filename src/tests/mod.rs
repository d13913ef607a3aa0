// Test modules for portmap
// Each module exercises one component through its public surface

mod orchestrator_tests;
mod udp_gateway_tests;
