//! Typed declarations of the Safe contract family. The event set covers
//! every version the indexers understand; where versions disagree on a
//! signature each variant gets its own interface.

pub mod decoder;
pub mod multisend;

use alloy_sol_types::sol;

sol! {
    /// Safe management surface, v1.0.0 through v1.4.1. The event set is the
    /// L2 superset: singleton deployments that emit events for every state
    /// change, which the events mode indexer consumes instead of traces.
    #[derive(Debug, PartialEq, Eq)]
    interface ISafe {
        event SafeSetup(address indexed initiator, address[] owners, uint256 threshold, address initializer, address fallbackHandler);
        event AddedOwner(address owner);
        event RemovedOwner(address owner);
        event ChangedThreshold(uint256 threshold);
        event ChangedMasterCopy(address masterCopy);
        event ChangedFallbackHandler(address handler);
        event ChangedGuard(address guard);
        event EnabledModule(address module);
        event DisabledModule(address module);
        event ApproveHash(bytes32 indexed approvedHash, address indexed owner);
        event SignMsg(bytes32 indexed msgHash);
        event ExecutionSuccess(bytes32 txHash, uint256 payment);
        event ExecutionFailure(bytes32 txHash, uint256 payment);
        event ExecutionFromModuleSuccess(address indexed module);
        event ExecutionFromModuleFailure(address indexed module);
        event SafeMultiSigTransaction(address to, uint256 value, bytes data, uint8 operation, uint256 safeTxGas, uint256 baseGas, uint256 gasPrice, address gasToken, address refundReceiver, bytes signatures, bytes additionalInfo);
        event SafeModuleTransaction(address module, address to, uint256 value, bytes data, uint8 operation);

        function setup(address[] calldata _owners, uint256 _threshold, address to, bytes calldata data, address fallbackHandler, address paymentToken, uint256 payment, address payable paymentReceiver) external;
        function execTransaction(address to, uint256 value, bytes calldata data, uint8 operation, uint256 safeTxGas, uint256 baseGas, uint256 gasPrice, address gasToken, address payable refundReceiver, bytes calldata signatures) external payable returns (bool success);
        function approveHash(bytes32 hashToApprove) external;
        function addOwnerWithThreshold(address owner, uint256 _threshold) external;
        function removeOwner(address prevOwner, address owner, uint256 _threshold) external;
        function swapOwner(address prevOwner, address oldOwner, address newOwner) external;
        function changeThreshold(uint256 _threshold) external;
        function changeMasterCopy(address _masterCopy) external;
        function setFallbackHandler(address handler) external;
        function setGuard(address guard) external;
        function enableModule(address module) external;
        function disableModule(address prevModule, address module) external;
        function execTransactionFromModule(address to, uint256 value, bytes calldata data, uint8 operation) external returns (bool success);
        function execTransactionFromModuleReturnData(address to, uint256 value, bytes calldata data, uint8 operation) external returns (bool success, bytes returnData);
        function getOwners() external view returns (address[] memory);
        function getThreshold() external view returns (uint256);
        function nonce() external view returns (uint256);
        function VERSION() external view returns (string memory);
    }

    /// v1.0.0 setup lacks the payment and handler parameters.
    #[derive(Debug, PartialEq, Eq)]
    interface ISafeV100 {
        function setup(address[] calldata _owners, uint256 _threshold, address to, bytes calldata data) external;
        event ExecutionFailed(bytes32 txHash);
    }

    /// Proxy factory, v1.1.1: the event only carries the proxy.
    #[derive(Debug, PartialEq, Eq)]
    interface IProxyFactoryV111 {
        event ProxyCreation(address proxy);
    }

    /// Proxy factory, v1.3.0: adds the singleton the proxy points at.
    #[derive(Debug, PartialEq, Eq)]
    interface IProxyFactoryV130 {
        event ProxyCreation(address proxy, address singleton);
    }

    /// Proxy factory, v1.4.1: the proxy became an indexed topic.
    #[derive(Debug, PartialEq, Eq)]
    interface IProxyFactoryV141 {
        event ProxyCreation(address indexed proxy, address singleton);
    }

    /// ERC-20 Transfer: two indexed topics, value in the data section.
    #[derive(Debug, PartialEq, Eq)]
    interface IErc20 {
        event Transfer(address indexed from, address indexed to, uint256 value);
        function balanceOf(address owner) external view returns (uint256);
    }

    /// ERC-721 Transfer: same topic0 as ERC-20 but the token id is indexed,
    /// giving the log three indexed topics instead of two.
    #[derive(Debug, PartialEq, Eq)]
    interface IErc721 {
        event Transfer(address indexed from, address indexed to, uint256 indexed tokenId);
        function tokenURI(uint256 tokenId) external view returns (string memory);
        function ownerOf(uint256 tokenId) external view returns (address);
    }

    #[derive(Debug, PartialEq, Eq)]
    interface IMultiSend {
        function multiSend(bytes memory transactions) external payable;
    }
}
