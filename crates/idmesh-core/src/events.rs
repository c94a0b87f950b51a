//! Change events feeding the announce manager.

use crate::profile::Profile;

/// A change to the signable identity, delivered on the announce manager's
/// input channel.
///
/// Profile edits come from the profile-editing collaborator; node keys come
/// from the protocol handler's bind handshake.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    /// The local profile was edited
    ProfileChanged(Profile),
    /// A network node public key was claimed by this identity
    NodeKeyAdded([u8; 32]),
}
