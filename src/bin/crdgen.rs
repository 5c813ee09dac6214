use kube::CustomResourceExt;
use workspaces_operator::resources::{workspacekinds::WorkspaceKind, workspaces::Workspace};

fn main() -> anyhow::Result<()> {
    let crds = [Workspace::crd(), WorkspaceKind::crd()];
    for crd in &crds {
        print!("---\n{}", serde_yaml::to_string(crd)?);
    }
    Ok(())
}
