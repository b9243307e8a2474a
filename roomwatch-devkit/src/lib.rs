/*!
# RoomWatch DevKit - Outils de test sans broker

- `MockBroker` : transport en mémoire derrière les traits Connector/Session
- `TestHarness` : noeud complet câblé sur le mock, pour scénarios de bout en bout
*/

pub mod mock_transport;
pub mod test_utils;

pub use mock_transport::{MockBroker, MockConnector, MockMessage};
pub use test_utils::{HarnessBuilder, TestHarness};
