//! Shared test fixtures and cross-module tests
