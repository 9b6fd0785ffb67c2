//! Cross-module tests for the trainer, its hooks and checkpointing


mod checkpoint_tests;
mod hooks_tests;
mod integration_tests;
