// Copyright Istio Authors
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

use hickory_proto::rr::Name;

use crate::dns::Error;

/// Parses a dotted domain (with or without the trailing '.') into a lower-cased FQDN [Name].
/// The domain must already be in its ASCII-compatible form.
pub fn to_fqdn(domain: &str) -> Result<Name, Error> {
    let mut name =
        Name::from_ascii(domain).map_err(|e| Error::InvalidName(domain.to_string(), e))?;
    name.set_fqdn(true);
    Ok(name.to_lowercase())
}

/// Returns the canonical key form of the name: lower-cased and fully qualified.
pub fn canonical(name: &Name) -> Name {
    let mut name = name.to_lowercase();
    name.set_fqdn(true);
    name
}

/// Renders the name in dotted form without the trailing '.'.
pub fn strip_fqdn(name: &Name) -> String {
    let ascii = name.to_ascii();
    match ascii.strip_suffix('.') {
        Some(stripped) => stripped.to_string(),
        None => ascii,
    }
}
