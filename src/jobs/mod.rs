pub mod transfer_recovery;
