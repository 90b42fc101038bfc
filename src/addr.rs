// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use memory_addr::{def_usize_addr, def_usize_addr_formatter};

def_usize_addr! {
    /// Guest virtual (linear) address.
    pub type GuestVirtAddr;
    /// Guest physical address.
    pub type GuestPhysAddr;
    /// Host physical address.
    pub type HostPhysAddr;
}

def_usize_addr_formatter! {
    GuestVirtAddr = "GVA:{}";
    GuestPhysAddr = "GPA:{}";
    HostPhysAddr = "HPA:{}";
}
