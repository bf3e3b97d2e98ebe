use alloy::sol;

sol! {
    #[derive(Debug, PartialEq, Eq)]
    struct Immutables {
        bytes32 orderHash;
        bytes32 hashlock;
        address maker;
        address taker;
        address token;
        uint256 amount;
        uint256 safetyDeposit;
        uint256 timelocks;
    }

    #[sol(rpc)]
    interface IEscrowFactory {
        function createSrcEscrow(Immutables calldata immutables) external payable;

        function createDstEscrow(Immutables calldata immutables) external payable;

        function addressOfEscrowSrc(Immutables calldata immutables) external view returns (address);

        function addressOfEscrowDst(Immutables calldata immutables) external view returns (address);

        event SrcEscrowCreated(address escrow, bytes32 hashlock);

        event DstEscrowCreated(address escrow, bytes32 hashlock, address taker);
    }

    #[sol(rpc)]
    interface IEscrow {
        function withdraw(bytes32 secret, Immutables calldata immutables) external;

        function cancel(Immutables calldata immutables) external;

        event Withdrawal(bytes32 secret);

        event EscrowCancelled();
    }
}
