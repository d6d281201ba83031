// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Integration tests driving the introspection engine against a mock
//! hypervisor backend.

mod breakpoints;
mod hooks;
mod sessions;
mod snapshot;
mod translate;
