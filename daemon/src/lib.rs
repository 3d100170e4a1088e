/*
Copyright 2022 The Kuasar Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! podshim serves a container engine API on top of a CRI runtime and the
//! containerd content store.

pub mod args;
pub mod client;
pub mod codec;
pub mod config;
pub mod container;
pub mod events;
pub mod gc;
pub mod image;
pub mod logs;
pub mod manifest;
pub mod names;
pub mod network;
pub mod pod;
pub mod progress;
pub mod reference;
pub mod registry;
pub mod server;
pub mod service;
pub mod sync;
pub mod trace;
pub mod version;
pub mod volume;
