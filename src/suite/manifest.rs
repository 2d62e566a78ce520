//! Manifest projection of collected suites.

use super::id::TestIdentity;
use super::tree::{BlockId, Child, Suite};
use gridrun_proto::{Manifest, ManifestGroup, ManifestMember, ManifestTest, TestMeta};
use serde_json::{Map, Value};

/// One group per file, named by its relative path, holding the file's
/// describe blocks and tests in declaration order.
pub fn file_group(suite: &Suite, identity: &TestIdentity) -> ManifestMember {
    let file_name = identity.relative_file(suite.path());
    ManifestMember::Group(ManifestGroup {
        name: file_name.clone(),
        members: block_members(suite, suite.root(), identity, &file_name),
        tags: Vec::new(),
        meta: Map::new(),
    })
}

pub fn build_manifest<'a>(
    suites: impl IntoIterator<Item = &'a Suite>,
    identity: &TestIdentity,
    init_meta: Map<String, Value>,
) -> Manifest {
    Manifest {
        members: suites
            .into_iter()
            .map(|suite| file_group(suite, identity))
            .collect(),
        init_meta,
    }
}

fn block_members(
    suite: &Suite,
    block: BlockId,
    identity: &TestIdentity,
    file_name: &str,
) -> Vec<ManifestMember> {
    suite
        .block(block)
        .children
        .iter()
        .map(|child| match *child {
            Child::Block(b) => ManifestMember::Group(ManifestGroup {
                name: suite.block(b).name.clone(),
                members: block_members(suite, b, identity, file_name),
                tags: Vec::new(),
                meta: Map::new(),
            }),
            Child::Test(t) => ManifestMember::Test(ManifestTest {
                id: identity.id_of(suite, t),
                tags: Vec::new(),
                meta: TestMeta::for_file(file_name),
            }),
        })
        .collect()
}
