use std::sync::Arc;

use kube::runtime::reflector::Store;
use kube::{Resource, ResourceExt};

use crate::resources::workspaces::Workspace;

/// True when `obj` carries a controller reference to the Workspace named `owner`
pub(crate) fn controlled_by_workspace<K: Resource>(obj: &K, owner: &str) -> bool {
    obj.owner_references().iter().any(|r| {
        r.controller == Some(true)
            && r.kind == Workspace::kind(&())
            && r.api_version == Workspace::api_version(&())
            && r.name == owner
    })
}

/// All objects in `store` controlled by `ws`, in the Workspace's namespace
pub fn owned_by<K>(store: &Store<K>, ws: &Workspace) -> Vec<Arc<K>>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    let namespace = ws.namespace();
    let name = ws.name_any();
    let mut owned: Vec<Arc<K>> = store
        .state()
        .into_iter()
        .filter(|obj| obj.namespace() == namespace && controlled_by_workspace(obj.as_ref(), &name))
        .collect();
    owned.sort_by_key(|obj| obj.name_any());
    owned
}

/// All Workspaces in `store` that reference the WorkspaceKind `kind`
pub fn workspaces_of_kind(store: &Store<Workspace>, kind: &str) -> Vec<Arc<Workspace>> {
    store
        .state()
        .into_iter()
        .filter(|ws| ws.spec.kind == kind)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::workspaces::fixtures::workspace;
    use k8s_openapi::api::apps::v1::StatefulSet;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
    use kube::runtime::{reflector, watcher};

    fn statefulset(namespace: &str, name: &str, owner: Option<&Workspace>) -> StatefulSet {
        StatefulSet {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some(namespace.into()),
                owner_references: owner.map(|ws| vec![ws.controller_owner_ref(&()).unwrap()]),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn children_are_found_by_controller_reference() {
        let ws = workspace("default", "jupyter", "jupyterlab");
        let other = workspace("default", "other", "jupyterlab");
        let elsewhere = workspace("team-a", "jupyter", "jupyterlab");

        let (store, mut writer) = reflector::store::<StatefulSet>();
        for sts in [
            statefulset("default", "ws-jupyter-b2c3d", Some(&ws)),
            statefulset("default", "ws-jupyter-a1b2c", Some(&ws)),
            statefulset("default", "ws-other-xyz12", Some(&other)),
            statefulset("team-a", "ws-jupyter-zzzzz", Some(&elsewhere)),
            statefulset("default", "unowned", None),
        ] {
            writer.apply_watcher_event(&watcher::Event::Apply(sts));
        }

        let names: Vec<_> = owned_by(&store, &ws).iter().map(|s| s.name_any()).collect();
        assert_eq!(names, vec!["ws-jupyter-a1b2c", "ws-jupyter-b2c3d"]);
    }

    #[test]
    fn non_controller_references_are_ignored() {
        let ws = workspace("default", "jupyter", "jupyterlab");
        let mut sts = statefulset("default", "ws-jupyter-a1b2c", None);
        sts.metadata.owner_references = Some(vec![OwnerReference {
            controller: Some(false),
            ..ws.controller_owner_ref(&()).unwrap()
        }]);

        let (store, mut writer) = reflector::store::<StatefulSet>();
        writer.apply_watcher_event(&watcher::Event::Apply(sts));
        assert!(owned_by(&store, &ws).is_empty());
    }

    #[test]
    fn workspaces_are_found_by_kind() {
        let (store, mut writer) = reflector::store::<Workspace>();
        writer.apply_watcher_event(&watcher::Event::Apply(workspace("a", "one", "jupyterlab")));
        writer.apply_watcher_event(&watcher::Event::Apply(workspace("b", "two", "jupyterlab")));
        writer.apply_watcher_event(&watcher::Event::Apply(workspace("a", "three", "codeserver")));

        assert_eq!(workspaces_of_kind(&store, "jupyterlab").len(), 2);
        assert_eq!(workspaces_of_kind(&store, "codeserver").len(), 1);
        assert!(workspaces_of_kind(&store, "missing").is_empty());
    }
}
