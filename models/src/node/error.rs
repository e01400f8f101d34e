use snafu::Snafu;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Unable to list cluster nodes: '{}'", source))]
    ListNodes { source: kube::Error },

    #[snafu(display("Unable to fetch node '{}': '{}'", node_name, source))]
    GetNode {
        source: kube::Error,
        node_name: String,
    },

    #[snafu(display("Unable to cordon node '{}': '{}'", node_name, source))]
    CordonNode {
        source: kube::Error,
        node_name: String,
    },

    #[snafu(display("Unable to list pods bound to node '{}': '{}'", node_name, source))]
    ListPods {
        source: kube::Error,
        node_name: String,
    },

    #[snafu(display("Unable to delete pod '{}/{}': '{}'", namespace, pod_name, source))]
    DeletePod {
        source: kube::Error,
        namespace: String,
        pod_name: String,
    },
}
